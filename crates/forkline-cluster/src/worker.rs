// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker start gate and the shared listening socket.

use std::net::SocketAddr;
use std::time::Duration;

use forkline_protocol::{ControlSignal, Message};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::link::ParentLink;

/// Listen backlog for the shared HTTP socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Errors while waiting to be released by the primary.
#[derive(Debug, Error)]
pub enum GateError {
    /// The pipe to the primary closed before `"start"` arrived.
    #[error("Primary went away before releasing the worker")]
    ParentGone,
}

/// Holds a worker back until the primary has finished its startup tasks.
#[derive(Debug, Clone)]
pub struct WorkerGate {
    link: ParentLink,
}

impl WorkerGate {
    pub fn new(link: ParentLink) -> Self {
        Self { link }
    }

    /// Ping the primary with `"what now"` every `poll_interval` until it
    /// answers `"start"` or `"go ahead"`.
    ///
    /// Waits as long as the primary stays alive.
    pub async fn wait_for_start(&self, poll_interval: Duration) -> Result<(), GateError> {
        let mut state = self.link.watch();
        let mut pings: u64 = 0;

        loop {
            let current = *state.borrow_and_update();
            if current.released {
                info!(pings = pings, "Worker released");
                return Ok(());
            }
            if current.closed {
                return Err(GateError::ParentGone);
            }

            if self
                .link
                .send(Message::control(ControlSignal::WhatNow))
                .is_err()
            {
                return Err(GateError::ParentGone);
            }
            pings += 1;
            debug!(pings = pings, "Waiting for primary");

            tokio::select! {
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(GateError::ParentGone);
                    }
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Bind `addr` with `SO_REUSEADDR` and `SO_REUSEPORT` so every worker can
/// listen on the same port and the kernel spreads connections across them.
pub fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    socket.set_nonblocking(true)?;

    let listener = TcpListener::from_std(socket.into())?;
    debug!(addr = %addr, "Listening socket bound");
    Ok(listener)
}
