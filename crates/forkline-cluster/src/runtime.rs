// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster runtime: one entry point for both the primary and its workers.
//!
//! The same binary runs in both roles. The primary opens the shared stores,
//! forks workers, runs startup tasks, and then releases the workers. A
//! worker connects to its parent over stdio, mirrors the stores, waits at
//! the start gate, and serves HTTP on the shared port.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use forkline_cluster::{ClusterRuntime, Config, RouterApplication};
//! use forkline_core::StoreOptions;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!
//!     ClusterRuntime::builder()
//!         .application(Arc::new(RouterApplication::with_default_routes(&config.store_channel)))
//!         .store(&config.store_path, StoreOptions::new(&config.store_channel))
//!         .startup_task(Arc::new(MyMigrations))
//!         .config(config)
//!         .build()?
//!         .run()
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use forkline_core::{
    DistributedLock, KeyedMutex, RedisLockStore, Role, SharedStore, StoreOptions, StoreRegistry,
};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::app::{Application, ServeContext, ServeOptions};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::link::{ParentLink, PrimaryLink};
use crate::resources::{ResourceSnapshot, worker_count};
use crate::spawner::{ProcessSpawner, WorkerSpawner};
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorHandle};
use crate::worker::{WorkerGate, bind_listener};

/// Shared state handed to startup tasks on the primary.
#[derive(Debug, Clone)]
pub struct ClusterContext {
    role: Role,
    registry: StoreRegistry,
    mutex: KeyedMutex,
    lock: Option<DistributedLock>,
}

impl ClusterContext {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    /// Store registered on `channel`.
    pub fn store(&self, channel: &str) -> Option<SharedStore> {
        self.registry.get(channel)
    }

    /// In-process mutex, shared with the stores' write queues.
    pub fn mutex(&self) -> &KeyedMutex {
        &self.mutex
    }

    /// Cross-process lock, when one is configured.
    pub fn lock(&self) -> Option<&DistributedLock> {
        self.lock.as_ref()
    }
}

/// Work the primary finishes before any worker starts serving.
#[async_trait]
pub trait StartupTask: Send + Sync {
    /// Name for logs and errors.
    fn name(&self) -> &str;

    async fn run(&self, ctx: &ClusterContext) -> anyhow::Result<()>;
}

struct StoreSpec {
    path: PathBuf,
    options: StoreOptions,
}

/// Builder for creating a [`ClusterRuntime`].
#[derive(Default)]
pub struct ClusterRuntimeBuilder {
    config: Option<Config>,
    role: Option<Role>,
    application: Option<Arc<dyn Application>>,
    startup_tasks: Vec<Arc<dyn StartupTask>>,
    stores: Vec<StoreSpec>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    lock: Option<DistributedLock>,
}

impl ClusterRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cluster configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Force a role instead of reading it from the environment.
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Application served by every worker (required).
    pub fn application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = Some(application);
        self
    }

    /// Run `task` on the primary before workers are released. Tasks run in
    /// the order they were added.
    pub fn startup_task(mut self, task: Arc<dyn StartupTask>) -> Self {
        self.startup_tasks.push(task);
        self
    }

    /// Open a shared store at `path` in every process.
    pub fn store(mut self, path: impl Into<PathBuf>, options: StoreOptions) -> Self {
        self.stores.push(StoreSpec {
            path: path.into(),
            options,
        });
        self
    }

    /// How workers are launched. Defaults to re-executing the current binary.
    pub fn spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Distributed lock for startup tasks. Without one, a Redis lock is
    /// connected when `redis_url` is configured.
    pub fn lock(mut self, lock: DistributedLock) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Build the runtime.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ClusterRuntime> {
        let config = self.config.ok_or(Error::Missing("config"))?;
        let application = self.application.ok_or(Error::Missing("application"))?;

        Ok(ClusterRuntime {
            config,
            role: self.role.unwrap_or_else(Role::from_env),
            application,
            startup_tasks: self.startup_tasks,
            stores: self.stores,
            spawner: self.spawner,
            lock: self.lock,
        })
    }
}

/// A configured cluster process, not yet started.
pub struct ClusterRuntime {
    config: Config,
    role: Role,
    application: Arc<dyn Application>,
    startup_tasks: Vec<Arc<dyn StartupTask>>,
    stores: Vec<StoreSpec>,
    spawner: Option<Arc<dyn WorkerSpawner>>,
    lock: Option<DistributedLock>,
}

impl ClusterRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ClusterRuntimeBuilder {
        ClusterRuntimeBuilder::new()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Run this process in its role until SIGINT or SIGTERM, or, for a
    /// worker, until the primary goes away.
    pub async fn run(self) -> Result<()> {
        match self.role {
            Role::Primary => {
                let primary = self.start_primary().await?;
                if let Err(e) = shutdown_signal().await {
                    warn!(error = %e, "Signal handling unavailable, shutting down");
                }
                info!("Shutdown signal received");
                primary.shutdown().await
            }
            Role::Worker { .. } => {
                let (shutdown_tx, shutdown) = watch::channel(false);
                tokio::spawn(async move {
                    if let Err(e) = shutdown_signal().await {
                        warn!(error = %e, "Signal handling unavailable");
                        return;
                    }
                    info!("Shutdown signal received");
                    let _ = shutdown_tx.send(true);
                });

                let registry = StoreRegistry::new();
                let link = ParentLink::stdio(registry.clone());
                self.run_worker(registry, link, shutdown).await
            }
        }
    }

    /// Primary flow up to and including releasing the workers.
    ///
    /// Stores are opened before forking so workers find the files in place.
    /// If a startup task fails, the workers are killed and the error is
    /// returned.
    pub async fn start_primary(self) -> Result<PrimaryRuntime> {
        let registry = StoreRegistry::new();
        let mutex = KeyedMutex::new();
        let link = PrimaryLink::new();

        for spec in self.stores {
            let store = SharedStore::open(
                spec.path,
                spec.options,
                Role::Primary,
                Arc::new(link.clone()),
                mutex.clone(),
            )
            .await?;
            registry.register(store)?;
        }

        let lock = match (self.lock, &self.config.redis_url) {
            (Some(lock), _) => Some(lock),
            (None, Some(url)) => {
                let store = RedisLockStore::connect(url).await?;
                Some(DistributedLock::new(Arc::new(store)))
            }
            (None, None) => None,
        };

        let spawner: Arc<dyn WorkerSpawner> = match self.spawner {
            Some(spawner) => spawner,
            None => Arc::new(ProcessSpawner::current_exe()?),
        };

        let snapshot = ResourceSnapshot::detect();
        let workers = worker_count(snapshot, self.config.limits);
        info!(
            workers = workers,
            cpus = snapshot.cpus,
            total_memory_mb = snapshot.total_memory_bytes / (1024 * 1024),
            stores = ?registry.channels(),
            "Starting primary"
        );

        let supervisor = Supervisor::start(
            SupervisorConfig {
                workers,
                restart_policy: self.config.restart_policy,
            },
            spawner,
            registry.clone(),
        );
        link.attach(supervisor.handle());

        let context = ClusterContext {
            role: Role::Primary,
            registry,
            mutex,
            lock,
        };

        for task in &self.startup_tasks {
            info!(task = task.name(), "Running startup task");
            if let Err(source) = task.run(&context).await {
                error!(task = task.name(), error = %source, "Startup task failed");
                if let Err(e) = supervisor.shutdown().await {
                    error!("Supervisor error during shutdown: {}", e);
                }
                return Err(Error::StartupTask {
                    name: task.name().to_string(),
                    source,
                });
            }
        }

        supervisor.mark_ready()?;

        Ok(PrimaryRuntime {
            supervisor,
            context,
        })
    }

    /// Worker flow over an existing parent link.
    ///
    /// `registry` must be the one `link` dispatches updates to. Returns when
    /// `shutdown` fires or the parent goes away.
    pub async fn run_worker(
        self,
        registry: StoreRegistry,
        link: ParentLink,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mutex = KeyedMutex::new();
        for spec in self.stores {
            let store = SharedStore::open(
                spec.path,
                spec.options,
                self.role,
                Arc::new(link.clone()),
                mutex.clone(),
            )
            .await?;
            registry.register(store)?;
        }

        let gate = WorkerGate::new(link.clone());
        tokio::select! {
            released = gate.wait_for_start(self.config.poll_interval) => released?,
            _ = stop_requested(&mut shutdown) => {
                info!("Shutdown before start");
                return Ok(());
            }
        }

        let listener = bind_listener(self.config.bind_addr).map_err(|source| Error::Bind {
            addr: self.config.bind_addr,
            source,
        })?;

        // Stop serving on a signal or when the parent goes away.
        let (stop_tx, stop) = watch::channel(false);
        let parent = link.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.closed() => info!("Primary gone, stopping worker"),
                _ = stop_requested(&mut shutdown) => {}
            }
            let _ = stop_tx.send(true);
        });

        let ctx = ServeContext {
            role: self.role,
            registry,
            options: ServeOptions::from_config(&self.config),
            shutdown: stop,
        };
        self.application
            .serve(listener, ctx)
            .await
            .map_err(Error::Application)?;

        info!(role = %self.role, "Worker stopped");
        Ok(())
    }
}

/// A primary whose workers have been released.
pub struct PrimaryRuntime {
    supervisor: Supervisor,
    context: ClusterContext,
}

impl PrimaryRuntime {
    pub fn supervisor(&self) -> SupervisorHandle {
        self.supervisor.handle()
    }

    pub fn context(&self) -> &ClusterContext {
        &self.context
    }

    /// Kill every worker and stop supervising.
    pub async fn shutdown(self) -> Result<()> {
        info!("Primary shutting down...");
        self.supervisor.shutdown().await?;
        info!("Primary shutdown complete");
        Ok(())
    }
}

/// Resolve once `shutdown` is `true`. A dropped sender never fires.
async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}
