// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker start gate tests over in-memory pipes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use forkline_cluster::{
    ClusterRuntime, Config, GateError, ParentLink, RouterApplication, WorkerGate,
};
use forkline_core::{Role, StoreOptions, StoreRegistry};
use forkline_protocol::{ControlSignal, FramedStream, Message};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

/// The primary's ends of a worker pipe.
struct Primary {
    from_worker: FramedStream<ReadHalf<DuplexStream>>,
    to_worker: FramedStream<WriteHalf<DuplexStream>>,
}

fn pipe(registry: StoreRegistry) -> (ParentLink, Primary) {
    let (worker_end, primary_end) = tokio::io::duplex(64 * 1024);
    let (worker_read, worker_write) = tokio::io::split(worker_end);
    let (primary_read, primary_write) = tokio::io::split(primary_end);
    (
        ParentLink::new(worker_read, worker_write, registry),
        Primary {
            from_worker: FramedStream::new(primary_read),
            to_worker: FramedStream::new(primary_write),
        },
    )
}

/// A port nothing is listening on right now.
async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_until_listening(addr: SocketAddr) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while TcpStream::connect(addr).await.is_err() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker did not bind after start"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_gate_pings_until_start() {
    let (link, mut primary) = pipe(StoreRegistry::new());
    let gate = WorkerGate::new(link);
    let waiting = tokio::spawn(async move { gate.wait_for_start(Duration::from_millis(10)).await });

    for _ in 0..3 {
        let ping = primary.from_worker.recv().await.unwrap();
        assert_eq!(ping, Message::control(ControlSignal::WhatNow));
    }
    assert!(!waiting.is_finished());

    primary
        .to_worker
        .send(&Message::control(ControlSignal::Start))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_gate_released_by_go_ahead() {
    let (link, mut primary) = pipe(StoreRegistry::new());
    let gate = WorkerGate::new(link);
    let waiting = tokio::spawn(async move { gate.wait_for_start(Duration::from_millis(10)).await });

    // Answer the first ping the way a ready primary does
    let ping = primary.from_worker.recv().await.unwrap();
    assert_eq!(ping, Message::control(ControlSignal::WhatNow));
    primary
        .to_worker
        .send(&Message::control(ControlSignal::GoAhead))
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_gate_fails_when_parent_goes_away() {
    let (link, primary) = pipe(StoreRegistry::new());
    let gate = WorkerGate::new(link);
    let waiting = tokio::spawn(async move { gate.wait_for_start(Duration::from_millis(10)).await });

    drop(primary);

    let result = tokio::time::timeout(Duration::from_secs(1), waiting)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(GateError::ParentGone)));
}

#[tokio::test]
async fn test_worker_binds_only_after_start() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("shared.json");
    let addr = free_addr().await;

    let config = Config {
        bind_addr: addr,
        poll_interval: Duration::from_millis(10),
        ..Config::default()
    };
    let runtime = ClusterRuntime::builder()
        .config(config)
        .role(Role::Worker { id: 1 })
        .application(Arc::new(RouterApplication::with_default_routes("config")))
        .store(&store_path, StoreOptions::new("config"))
        .build()
        .unwrap();

    let registry = StoreRegistry::new();
    let (link, mut primary) = pipe(registry.clone());
    let (shutdown_tx, shutdown) = watch::channel(false);
    let worker = tokio::spawn(runtime.run_worker(registry, link, shutdown));

    // Still gated: pinging, not listening
    for _ in 0..5 {
        let ping = primary.from_worker.recv().await.unwrap();
        assert_eq!(ping, Message::control(ControlSignal::WhatNow));
    }
    assert!(TcpStream::connect(addr).await.is_err());
    assert!(!worker.is_finished());

    primary
        .to_worker
        .send(&Message::control(ControlSignal::Start))
        .await
        .unwrap();
    wait_until_listening(addr).await;

    let response = http_get(addr, "/health").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("\"role\":\"worker-1\""));

    // The mirror follows broadcasts from the primary
    primary
        .to_worker
        .send(&Message::store_update(
            "config",
            json!({"db": {"models": {"User": "user"}}}),
        ))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let response = http_get(addr, "/config").await;
        if response.contains(r#""User":"user""#) {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "{response}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Only the primary writes the file
    assert!(!store_path.exists());

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_update_before_stores_open_reaches_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("shared.json");
    std::fs::write(&store_path, r#"{"db": {}}"#).unwrap();
    let addr = free_addr().await;

    let config = Config {
        bind_addr: addr,
        poll_interval: Duration::from_millis(10),
        ..Config::default()
    };
    let runtime = ClusterRuntime::builder()
        .config(config)
        .role(Role::Worker { id: 4 })
        .application(Arc::new(RouterApplication::with_default_routes("config")))
        .store(&store_path, StoreOptions::new("config"))
        .build()
        .unwrap();

    // The primary seeds the store while the worker is still starting up
    let registry = StoreRegistry::new();
    let (link, mut primary) = pipe(registry.clone());
    primary
        .to_worker
        .send(&Message::store_update(
            "config",
            json!({"db": {"models": {"User": "user"}}}),
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (shutdown_tx, shutdown) = watch::channel(false);
    let worker = tokio::spawn(runtime.run_worker(registry, link, shutdown));
    primary
        .to_worker
        .send(&Message::control(ControlSignal::Start))
        .await
        .unwrap();
    wait_until_listening(addr).await;

    let response = http_get(addr, "/config").await;
    assert!(response.contains(r#""User":"user""#), "{response}");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_worker_stops_when_parent_goes_away() {
    let addr = free_addr().await;
    let config = Config {
        bind_addr: addr,
        poll_interval: Duration::from_millis(10),
        ..Config::default()
    };
    let runtime = ClusterRuntime::builder()
        .config(config)
        .role(Role::Worker { id: 2 })
        .application(Arc::new(RouterApplication::with_default_routes("config")))
        .build()
        .unwrap();

    let registry = StoreRegistry::new();
    let (link, mut primary) = pipe(registry.clone());
    let (_shutdown_tx, shutdown) = watch::channel(false);
    let worker = tokio::spawn(runtime.run_worker(registry, link, shutdown));

    primary
        .to_worker
        .send(&Message::control(ControlSignal::Start))
        .await
        .unwrap();
    wait_until_listening(addr).await;

    drop(primary);

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_worker_forwards_mutations_to_primary() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("shared.json");
    let addr = free_addr().await;

    let config = Config {
        bind_addr: addr,
        poll_interval: Duration::from_millis(10),
        ..Config::default()
    };
    let runtime = ClusterRuntime::builder()
        .config(config)
        .role(Role::Worker { id: 3 })
        .application(Arc::new(RouterApplication::new("writer", |ctx| {
            let store = ctx.registry.get("config").unwrap();
            axum::Router::new().route(
                "/touch",
                axum::routing::get(move || {
                    let store = store.clone();
                    async move {
                        store.set("touched", json!(true)).await.unwrap();
                        "ok"
                    }
                }),
            )
        })))
        .store(&store_path, StoreOptions::new("config"))
        .build()
        .unwrap();

    let registry = StoreRegistry::new();
    let (link, mut primary) = pipe(registry.clone());
    let (shutdown_tx, shutdown) = watch::channel(false);
    let worker = tokio::spawn(runtime.run_worker(registry, link, shutdown));

    primary
        .to_worker
        .send(&Message::control(ControlSignal::Start))
        .await
        .unwrap();
    wait_until_listening(addr).await;

    let response = http_get(addr, "/touch").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    // Skip gate pings still in flight
    let forwarded = loop {
        match primary.from_worker.recv().await.unwrap() {
            Message::StoreMutation(mutation) => break mutation,
            Message::Control(ControlSignal::WhatNow) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    };
    assert_eq!(forwarded.channel, "config");
    assert_eq!(forwarded.mutation.path(), "touched");

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
