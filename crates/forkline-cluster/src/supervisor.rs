// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker supervision.
//!
//! One supervisor task owns every worker handle. Each worker gets three
//! helper tasks:
//!
//! ```text
//!              ┌──────────── supervisor task (owns slots) ◄───────────┐
//!              │                                                      │
//!   outbox ────┼──► writer task ──► child stdin                       │
//!              │                                                      │
//!              │    reader task ◄── child stdout ── FromWorker ───────┤
//!              │                                                      │
//!              └──► wait task (child.wait / kill) ── Exited ──────────┘
//! ```
//!
//! A dead worker is replaced according to the [`RestartPolicy`]. Workers are
//! held at their start gate until [`SupervisorHandle::mark_ready`] is called.
//!
//! Store mutations forwarded by workers go to a single applier task, so the
//! primary applies them one at a time in the order they were read.

use std::collections::{HashMap, VecDeque};
use std::os::unix::process::ExitStatusExt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use forkline_core::StoreRegistry;
use forkline_protocol::{ControlSignal, Frame, FrameError, FramedStream, Message, StoreMutation};
use nix::sys::signal::Signal;
use serde::Serialize;
use thiserror::Error;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::spawner::WorkerSpawner;

/// Delay before retrying a worker whose process could not be started.
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Capacity of the supervisor event channel.
const EVENT_CAPACITY: usize = 256;

/// What to do when a worker exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Always fork a replacement immediately.
    #[default]
    Permanent,
    /// Fork a replacement after `backoff`, unless the slot already restarted
    /// `max_restarts` times within `window`; then give the slot up.
    Bounded {
        max_restarts: u32,
        window: Duration,
        backoff: Duration,
    },
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Number of worker slots.
    pub workers: usize,
    pub restart_policy: RestartPolicy,
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The supervisor task is gone.
    #[error("Supervisor has stopped")]
    Stopped,

    /// The supervisor task panicked.
    #[error("Supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The message cannot be put on the wire.
    #[error("Failed to encode message: {0}")]
    Frame(#[from] FrameError),
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// A worker process started in `slot`.
    Spawned { slot: usize, id: u32, pid: Option<u32> },
    /// A worker process ended.
    Exited {
        slot: usize,
        id: u32,
        pid: Option<u32>,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// Starting a worker failed; it will be retried.
    SpawnFailed { slot: usize, error: String },
    /// The restart policy gave up on `slot`.
    Abandoned { slot: usize, restarts: usize },
}

/// Live worker, as reported by [`SupervisorHandle::workers`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerInfo {
    pub slot: usize,
    pub id: u32,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

enum Command {
    MarkReady,
    Broadcast(Frame),
    Workers(oneshot::Sender<Vec<WorkerInfo>>),
    Shutdown(oneshot::Sender<()>),
    FromWorker {
        id: u32,
        message: Message,
    },
    Exited {
        slot: usize,
        id: u32,
        code: Option<i32>,
        signal: Option<i32>,
    },
    Respawn {
        slot: usize,
    },
}

/// Cloneable handle for talking to the supervisor task.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl std::fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorHandle")
            .field("running", &!self.commands.is_closed())
            .finish()
    }
}

impl SupervisorHandle {
    /// Release every current and future worker from its start gate.
    pub fn mark_ready(&self) -> Result<(), SupervisorError> {
        self.send(Command::MarkReady)
    }

    /// Send `message` to every live worker.
    ///
    /// The message is encoded here, so a message too large for one frame is
    /// rejected without touching the worker pipes.
    pub fn broadcast(&self, message: Message) -> Result<(), SupervisorError> {
        let frame = message.to_frame()?;
        self.send(Command::Broadcast(frame))
    }

    /// Live workers, ordered by id.
    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Workers(tx))?;
        rx.await.map_err(|_| SupervisorError::Stopped)
    }

    /// Subscribe to lifecycle events from now on.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    fn send(&self, command: Command) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .map_err(|_| SupervisorError::Stopped)
    }
}

/// Running supervisor. Call [`shutdown`](Self::shutdown) to stop it and kill
/// every worker.
pub struct Supervisor {
    handle: SupervisorHandle,
    task: JoinHandle<()>,
}

impl Supervisor {
    /// Fork `config.workers` workers and start supervising them.
    ///
    /// Store mutations forwarded by workers are applied through `registry`.
    pub fn start(
        config: SupervisorConfig,
        spawner: Arc<dyn WorkerSpawner>,
        registry: StoreRegistry,
    ) -> Self {
        let (commands, inbox) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (mutations, pending) = mpsc::unbounded_channel();
        tokio::spawn(apply_mutations(registry, pending));

        info!(
            workers = config.workers,
            spawner = spawner.spawner_type(),
            restart_policy = ?config.restart_policy,
            "Supervisor starting"
        );

        let state = SupervisorLoop {
            restarts: vec![VecDeque::new(); config.workers],
            config,
            spawner,
            mutations,
            commands: commands.clone(),
            events: events.clone(),
            ready: false,
            next_id: 1,
            workers: HashMap::new(),
        };
        let task = tokio::spawn(state.run(inbox));

        Self {
            handle: SupervisorHandle { commands, events },
            task,
        }
    }

    /// Handle usable from other tasks.
    pub fn handle(&self) -> SupervisorHandle {
        self.handle.clone()
    }

    pub fn mark_ready(&self) -> Result<(), SupervisorError> {
        self.handle.mark_ready()
    }

    pub fn broadcast(&self, message: Message) -> Result<(), SupervisorError> {
        self.handle.broadcast(message)
    }

    pub async fn workers(&self) -> Result<Vec<WorkerInfo>, SupervisorError> {
        self.handle.workers().await
    }

    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.handle.events()
    }

    /// Kill every worker, wait for them to exit and stop the supervisor.
    pub async fn shutdown(self) -> Result<(), SupervisorError> {
        info!("Supervisor shutting down...");
        let (tx, rx) = oneshot::channel();
        if self.handle.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        self.task.await?;
        info!("Supervisor shutdown complete");
        Ok(())
    }
}

struct WorkerSlot {
    info: WorkerInfo,
    outbox: mpsc::UnboundedSender<Frame>,
    kill: Option<oneshot::Sender<()>>,
    wait: JoinHandle<()>,
}

struct SupervisorLoop {
    config: SupervisorConfig,
    spawner: Arc<dyn WorkerSpawner>,
    /// Feeds the applier task; dropping it ends that task.
    mutations: mpsc::UnboundedSender<StoreMutation>,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SupervisorEvent>,
    ready: bool,
    next_id: u32,
    workers: HashMap<u32, WorkerSlot>,
    /// Restart times per slot, for the bounded policy.
    restarts: Vec<VecDeque<Instant>>,
}

impl SupervisorLoop {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command>) {
        for slot in 0..self.config.workers {
            self.spawn_worker(slot);
        }

        while let Some(command) = inbox.recv().await {
            match command {
                Command::MarkReady => self.mark_ready(),
                Command::Broadcast(frame) => self.broadcast(&frame),
                Command::Workers(reply) => {
                    let _ = reply.send(self.worker_infos());
                }
                Command::FromWorker { id, message } => self.handle_message(id, message),
                Command::Exited {
                    slot,
                    id,
                    code,
                    signal,
                } => self.handle_exit(slot, id, code, signal),
                Command::Respawn { slot } => self.spawn_worker(slot),
                Command::Shutdown(reply) => {
                    self.kill_all().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }
    }

    fn spawn_worker(&mut self, slot: usize) {
        let id = self.next_id;
        self.next_id += 1;

        let mut child = match self.spawner.spawn(id) {
            Ok(child) => child,
            Err(e) => {
                error!(slot = slot, worker_id = id, error = %e, "Failed to spawn worker");
                let _ = self.events.send(SupervisorEvent::SpawnFailed {
                    slot,
                    error: e.to_string(),
                });
                self.schedule_respawn(slot, SPAWN_RETRY_DELAY);
                return;
            }
        };

        let pid = child.id();
        let (outbox, outgoing) = mpsc::unbounded_channel();
        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(write_to_worker(id, stdin, outgoing));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_from_worker(id, stdout, self.commands.clone()));
        }
        let (kill, killed) = oneshot::channel();
        let wait = tokio::spawn(wait_for_exit(slot, id, child, killed, self.commands.clone()));

        let info = WorkerInfo {
            slot,
            id,
            pid,
            started_at: Utc::now(),
        };
        info!(slot = slot, worker_id = id, pid = ?pid, "Worker started");
        let _ = self
            .events
            .send(SupervisorEvent::Spawned { slot, id, pid });

        self.workers.insert(
            id,
            WorkerSlot {
                info,
                outbox,
                kill: Some(kill),
                wait,
            },
        );
    }

    fn mark_ready(&mut self) {
        if self.ready {
            return;
        }
        self.ready = true;
        info!(workers = self.workers.len(), "Primary ready, starting workers");
        if let Some(frame) = control_frame(ControlSignal::Start) {
            self.broadcast(&frame);
        }
    }

    fn broadcast(&self, frame: &Frame) {
        for (id, worker) in &self.workers {
            if worker.outbox.send(frame.clone()).is_err() {
                debug!(worker_id = id, "Worker outbox closed, message dropped");
            }
        }
    }

    fn handle_message(&self, id: u32, message: Message) {
        match message {
            Message::Control(ControlSignal::WhatNow) => {
                if !self.ready {
                    return;
                }
                if let (Some(worker), Some(frame)) = (
                    self.workers.get(&id),
                    control_frame(ControlSignal::GoAhead),
                ) {
                    let _ = worker.outbox.send(frame);
                }
            }
            Message::StoreMutation(mutation) => {
                if self.mutations.send(mutation).is_err() {
                    warn!(worker_id = id, "Mutation applier gone, dropping forwarded mutation");
                }
            }
            other => {
                debug!(
                    worker_id = id,
                    message_type = ?other.message_type(),
                    "Ignoring message from worker"
                );
            }
        }
    }

    fn handle_exit(&mut self, slot: usize, id: u32, code: Option<i32>, signal: Option<i32>) {
        let pid = self.workers.remove(&id).and_then(|w| w.info.pid);
        let signal_name = signal
            .and_then(|s| Signal::try_from(s).ok())
            .map(Signal::as_str);
        warn!(
            slot = slot,
            worker_id = id,
            pid = ?pid,
            code = ?code,
            signal = ?signal_name,
            "Worker exited"
        );
        let _ = self.events.send(SupervisorEvent::Exited {
            slot,
            id,
            pid,
            code,
            signal,
        });

        match self.config.restart_policy {
            RestartPolicy::Permanent => self.spawn_worker(slot),
            RestartPolicy::Bounded {
                max_restarts,
                window,
                backoff,
            } => {
                let now = Instant::now();
                let history = &mut self.restarts[slot];
                while history
                    .front()
                    .is_some_and(|at| now.duration_since(*at) > window)
                {
                    history.pop_front();
                }

                if history.len() >= max_restarts as usize {
                    error!(
                        slot = slot,
                        restarts = history.len(),
                        window_secs = window.as_secs(),
                        "Worker slot is crash-looping, giving up"
                    );
                    let _ = self.events.send(SupervisorEvent::Abandoned {
                        slot,
                        restarts: history.len(),
                    });
                    return;
                }

                history.push_back(now);
                self.schedule_respawn(slot, backoff);
            }
        }
    }

    fn schedule_respawn(&self, slot: usize, delay: Duration) {
        if delay.is_zero() {
            let _ = self.commands.send(Command::Respawn { slot });
            return;
        }
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(Command::Respawn { slot });
        });
    }

    fn worker_infos(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self.workers.values().map(|w| w.info.clone()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    async fn kill_all(&mut self) {
        let mut workers: Vec<WorkerSlot> = self.workers.drain().map(|(_, w)| w).collect();
        for worker in workers.iter_mut() {
            if let Some(kill) = worker.kill.take() {
                let _ = kill.send(());
            }
        }
        for worker in workers {
            if let Err(e) = worker.wait.await {
                error!(worker_id = worker.info.id, "Worker wait task panicked: {}", e);
            }
        }
    }
}

fn control_frame(signal: ControlSignal) -> Option<Frame> {
    match Message::control(signal).to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            error!(signal = %signal, error = %e, "Failed to encode control signal");
            None
        }
    }
}

/// Apply forwarded mutations strictly in arrival order.
async fn apply_mutations(
    registry: StoreRegistry,
    mut pending: mpsc::UnboundedReceiver<StoreMutation>,
) {
    while let Some(mutation) = pending.recv().await {
        registry.dispatch_mutation(mutation).await;
    }
    debug!("Mutation applier stopped");
}

/// Frames are encoded before they are queued, so every error here is the
/// pipe itself failing.
async fn write_to_worker(
    id: u32,
    stdin: ChildStdin,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
) {
    let mut stream = FramedStream::new(stdin);
    while let Some(frame) = outgoing.recv().await {
        if let Err(e) = stream.write_frame(&frame).await {
            debug!(worker_id = id, error = %e, "Worker stdin closed");
            break;
        }
    }
}

async fn read_from_worker(
    id: u32,
    stdout: ChildStdout,
    commands: mpsc::UnboundedSender<Command>,
) {
    let mut stream = FramedStream::new(stdout);
    loop {
        match stream.recv().await {
            Ok(message) => {
                if commands.send(Command::FromWorker { id, message }).is_err() {
                    break;
                }
            }
            Err(FrameError::ConnectionClosed) => {
                debug!(worker_id = id, "Worker stdout closed");
                break;
            }
            Err(e) => {
                warn!(worker_id = id, error = %e, "Invalid frame from worker, closing reader");
                break;
            }
        }
    }
}

async fn wait_for_exit(
    slot: usize,
    id: u32,
    mut child: Child,
    killed: oneshot::Receiver<()>,
    commands: mpsc::UnboundedSender<Command>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = killed => {
            if let Err(e) = child.start_kill() {
                debug!(worker_id = id, error = %e, "Kill failed, worker already gone");
            }
            child.wait().await
        }
    };

    let (code, signal) = match status {
        Ok(status) => (status.code(), status.signal()),
        Err(e) => {
            warn!(worker_id = id, error = %e, "Failed to read worker exit status");
            (None, None)
        }
    };
    let _ = commands.send(Command::Exited {
        slot,
        id,
        code,
        signal,
    });
}
