// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forkline - Multi-Process HTTP Server
//!
//! The same binary is the primary and, when started with
//! `FORKLINE_WORKER_ID`, one of its workers. Workers use stdin/stdout to talk
//! to the primary, so all logging goes to stderr.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forkline_cluster::RouterApplication;
use forkline_cluster::config::Config;
use forkline_cluster::runtime::{ClusterContext, ClusterRuntime, StartupTask};
use forkline_core::{AcquireOptions, StoreOptions};
use tracing::{info, warn};

/// Records which primary started the cluster and when.
struct RecordStartup {
    channel: String,
}

#[async_trait]
impl StartupTask for RecordStartup {
    fn name(&self) -> &str {
        "record-startup"
    }

    async fn run(&self, ctx: &ClusterContext) -> anyhow::Result<()> {
        let store = ctx
            .store(&self.channel)
            .ok_or_else(|| anyhow::anyhow!("no store on channel {}", self.channel))?;

        let write = || async {
            let started_at = chrono::Utc::now().to_rfc3339();
            store
                .set("cluster.startedAt", serde_json::json!(started_at))
                .await?;
            store
                .set("cluster.primaryPid", serde_json::json!(std::process::id()))
                .await?;
            anyhow::Ok(())
        };

        // Several hosts may share the store file; one writer at a time.
        match ctx.lock() {
            Some(lock) => {
                let options = AcquireOptions::default().with_ttl(Duration::from_secs(10));
                match lock.with_lock("forkline:startup", options, write).await? {
                    Some(result) => result?,
                    None => warn!("Startup lock busy, skipping startup record"),
                }
            }
            None => write().await?,
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "forkline=info,forkline_cluster=info,forkline_core=info".into()
            }),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    let runtime = ClusterRuntime::builder()
        .application(Arc::new(RouterApplication::with_default_routes(
            &config.store_channel,
        )))
        .store(&config.store_path, StoreOptions::new(&config.store_channel))
        .startup_task(Arc::new(RecordStartup {
            channel: config.store_channel.clone(),
        }))
        .config(config.clone())
        .build()?;

    info!(
        role = %runtime.role(),
        addr = %config.bind_addr,
        store = %config.store_path.display(),
        "Starting Forkline"
    );

    runtime.run().await?;

    info!("Forkline shut down");

    Ok(())
}
