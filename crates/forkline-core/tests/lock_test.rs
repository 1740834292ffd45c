// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Distributed lock tests.
//!
//! Every property is checked against the in-memory store. The same checks run
//! against Redis when `TEST_REDIS_URL` is set:
//!
//! ```bash
//! TEST_REDIS_URL=redis://localhost:6379 cargo test -p forkline-core --test lock_test
//! ```

use std::sync::Arc;
use std::time::Duration;

use forkline_core::lock::lock_key;
use forkline_core::{
    AcquireOptions, DistributedLock, LockError, LockStore, MemoryLockStore, RedisLockStore,
};

/// Lock names must not collide between concurrent test runs on one Redis.
fn unique(name: &str) -> String {
    format!("{}-{}", name, uuid::Uuid::new_v4().simple())
}

async fn redis_lock() -> Option<DistributedLock> {
    let url = match std::env::var("TEST_REDIS_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping Redis test: TEST_REDIS_URL not set");
            return None;
        }
    };
    let store = RedisLockStore::connect(&url)
        .await
        .expect("failed to connect to TEST_REDIS_URL");
    Some(DistributedLock::new(Arc::new(store)))
}

fn memory_lock() -> DistributedLock {
    DistributedLock::new(Arc::new(MemoryLockStore::new()))
}

async fn check_mutual_exclusion(lock: &DistributedLock) {
    let name = unique("seed");
    let ttl = Duration::from_secs(5);

    let first = lock.try_acquire(&name, ttl).await.unwrap();
    assert!(first.is_some(), "first acquire must succeed");

    let second = lock.try_acquire(&name, ttl).await.unwrap();
    assert!(second.is_none(), "second acquire must see contention");

    assert!(lock.release(&name, &first.unwrap()).await.unwrap());

    let third = lock.try_acquire(&name, ttl).await.unwrap();
    assert!(third.is_some(), "acquire after release must succeed");
    lock.release(&name, &third.unwrap()).await.unwrap();
}

async fn check_double_release(lock: &DistributedLock) {
    let name = unique("double");
    let token = lock
        .try_acquire(&name, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    assert!(lock.release(&name, &token).await.unwrap());
    assert!(!lock.release(&name, &token).await.unwrap());
}

async fn check_stale_token_cannot_release(lock: &DistributedLock) {
    let name = unique("stale");
    let stale = lock
        .try_acquire(&name, Duration::from_millis(200))
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let fresh = lock
        .try_acquire(&name, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(fresh.is_some(), "expired lock must be acquirable");

    // The expired holder must not remove the new holder's lock.
    assert!(!lock.release(&name, &stale).await.unwrap());
    assert!(lock.try_acquire(&name, Duration::from_secs(5)).await.unwrap().is_none());

    lock.release(&name, &fresh.unwrap()).await.unwrap();
}

async fn check_retry_waits_for_release(lock: &DistributedLock) {
    let name = unique("retry");
    let held = lock
        .try_acquire(&name, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    let releaser = {
        let lock = lock.clone();
        let name = name.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            lock.release(&name, &held).await.unwrap()
        })
    };

    let options = AcquireOptions::default()
        .with_ttl(Duration::from_secs(5))
        .with_retry_delay(Duration::from_millis(50))
        .with_max_retries(20);
    let token = lock.acquire(&name, options).await.unwrap();
    assert!(token.is_some(), "retrying acquire must win after release");
    assert!(releaser.await.unwrap());

    lock.release(&name, &token.unwrap()).await.unwrap();
}

#[tokio::test]
async fn test_mutual_exclusion_memory() {
    check_mutual_exclusion(&memory_lock()).await;
}

#[tokio::test]
async fn test_double_release_memory() {
    check_double_release(&memory_lock()).await;
}

#[tokio::test]
async fn test_stale_token_memory() {
    check_stale_token_cannot_release(&memory_lock()).await;
}

#[tokio::test]
async fn test_retry_memory() {
    check_retry_waits_for_release(&memory_lock()).await;
}

#[tokio::test]
async fn test_exhausted_retries_return_none() {
    let lock = memory_lock();
    let _held = lock
        .try_acquire("busy", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    let options = AcquireOptions::default()
        .with_retry_delay(Duration::from_millis(5))
        .with_max_retries(3);
    assert!(lock.acquire("busy", options).await.unwrap().is_none());
}

#[tokio::test]
async fn test_store_failure_propagates() {
    let store = Arc::new(MemoryLockStore::new());
    let lock = DistributedLock::new(store.clone());
    store.set_unavailable(true);

    let result = lock.try_acquire("x", Duration::from_secs(1)).await;
    assert!(matches!(result, Err(LockError::Store(_))));

    let result = lock
        .with_lock("x", AcquireOptions::once(Duration::from_secs(1)), || async { 1 })
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_token_stored_under_namespaced_key() {
    let store = Arc::new(MemoryLockStore::new());
    let lock = DistributedLock::new(store.clone());

    let token = lock
        .try_acquire("config", Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(store.holder(&lock_key("config")).as_deref(), Some(token.as_str()));
    assert_eq!(store.store_type(), "memory");
}

#[tokio::test]
async fn test_mutual_exclusion_redis() {
    let Some(lock) = redis_lock().await else { return };
    check_mutual_exclusion(&lock).await;
}

#[tokio::test]
async fn test_double_release_redis() {
    let Some(lock) = redis_lock().await else { return };
    check_double_release(&lock).await;
}

#[tokio::test]
async fn test_stale_token_redis() {
    let Some(lock) = redis_lock().await else { return };
    check_stale_token_cannot_release(&lock).await;
}

#[tokio::test]
async fn test_retry_redis() {
    let Some(lock) = redis_lock().await else { return };
    check_retry_waits_for_release(&lock).await;
}

#[tokio::test]
async fn test_unreachable_redis_errors() {
    if std::env::var("TEST_REDIS_URL").is_err() {
        eprintln!("Skipping Redis test: TEST_REDIS_URL not set");
        return;
    }
    // Nothing listens on port 1; connecting must fail rather than hang.
    let result = RedisLockStore::connect("redis://127.0.0.1:1").await;
    assert!(matches!(result, Err(LockError::Redis(_))));
}
