/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::store::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::info;

/// Shared set store for the two membership sets the indexing policies query:
/// subscribers (local accounts) and tracked actors (subscribers plus everyone
/// subscribers follow). Derived and rebuildable; never authoritative — the
/// relational store is, and [`rebuild`] recovers from any cache loss.
///
/// Reads are side-effect-free, writes are idempotent, and empty bulk inputs
/// are accepted as no-ops.
#[async_trait]
pub trait MembershipCache: Send + Sync {
    async fn is_subscriber(&self, did: &str) -> Result<bool>;
    /// True if any of the given DIDs is a subscriber.
    async fn has_subscriber(&self, dids: &[String]) -> Result<bool>;
    async fn is_tracked_actor(&self, did: &str) -> Result<bool>;
    /// True if any of the given DIDs is a tracked actor.
    async fn has_tracked_actor(&self, dids: &[String]) -> Result<bool>;

    async fn add_subscriber(&self, did: &str) -> Result<()>;
    async fn remove_subscriber(&self, did: &str) -> Result<()>;
    async fn add_tracked_actor(&self, did: &str) -> Result<()>;
    async fn remove_tracked_actor(&self, did: &str) -> Result<()>;

    async fn bulk_add_subscribers(&self, dids: &[String]) -> Result<()>;
    async fn bulk_add_tracked_actors(&self, dids: &[String]) -> Result<()>;

    async fn clear(&self) -> Result<()>;
}

/// Clears the cache and repopulates it from the store of truth: subscriber
/// DIDs first, then every DID followed by a subscriber. Only ever adds
/// records consistent with the database, so it is safe to run at any time.
pub async fn rebuild(cache: &dyn MembershipCache, store: &dyn Store) -> Result<()> {
    let subscribers = store.list_subscriber_dids().await?;
    let followed = store.list_subscriber_followed_dids().await?;
    cache.clear().await?;
    cache.bulk_add_subscribers(&subscribers).await?;
    cache.bulk_add_tracked_actors(&subscribers).await?;
    cache.bulk_add_tracked_actors(&followed).await?;
    info!(
        "membership cache rebuilt: {} subscribers, {} followed",
        subscribers.len(),
        followed.len()
    );
    Ok(())
}

pub struct RedisMembershipCache {
    conns: Vec<Mutex<ConnectionManager>>,
    next: AtomicUsize,
    prefix: String,
}

impl RedisMembershipCache {
    pub async fn connect(url: &str, prefix: &str, pool_size: usize) -> Result<Self> {
        let client = redis::Client::open(url).context("redis client open")?;
        let mut conns = Vec::with_capacity(pool_size.max(1));
        for _ in 0..pool_size.max(1) {
            let conn = ConnectionManager::new(client.clone())
                .await
                .context("redis connect")?;
            conns.push(Mutex::new(conn));
        }
        Ok(Self {
            conns,
            next: AtomicUsize::new(0),
            prefix: prefix.to_string(),
        })
    }

    fn handle(&self) -> &Mutex<ConnectionManager> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[idx]
    }

    fn subscribers_key(&self) -> String {
        format!("{}:subscribers", self.prefix)
    }

    fn tracked_key(&self) -> String {
        format!("{}:tracked_actors", self.prefix)
    }

    async fn any_member(&self, key: &str, dids: &[String]) -> Result<bool> {
        if dids.is_empty() {
            return Ok(false);
        }
        let mut conn = self.handle().lock().await;
        let hits: Vec<i64> = redis::cmd("SMISMEMBER")
            .arg(key)
            .arg(dids)
            .query_async(&mut *conn)
            .await?;
        Ok(hits.iter().any(|v| *v != 0))
    }

    async fn add_members(&self, key: &str, dids: &[String]) -> Result<()> {
        if dids.is_empty() {
            return Ok(());
        }
        let mut conn = self.handle().lock().await;
        let _: i64 = conn.sadd(key, dids).await?;
        Ok(())
    }
}

#[async_trait]
impl MembershipCache for RedisMembershipCache {
    async fn is_subscriber(&self, did: &str) -> Result<bool> {
        let mut conn = self.handle().lock().await;
        let hit: bool = conn.sismember(self.subscribers_key(), did).await?;
        Ok(hit)
    }

    async fn has_subscriber(&self, dids: &[String]) -> Result<bool> {
        self.any_member(&self.subscribers_key(), dids).await
    }

    async fn is_tracked_actor(&self, did: &str) -> Result<bool> {
        let mut conn = self.handle().lock().await;
        let hit: bool = conn.sismember(self.tracked_key(), did).await?;
        Ok(hit)
    }

    async fn has_tracked_actor(&self, dids: &[String]) -> Result<bool> {
        self.any_member(&self.tracked_key(), dids).await
    }

    async fn add_subscriber(&self, did: &str) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: i64 = conn.sadd(self.subscribers_key(), did).await?;
        Ok(())
    }

    async fn remove_subscriber(&self, did: &str) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: i64 = conn.srem(self.subscribers_key(), did).await?;
        Ok(())
    }

    async fn add_tracked_actor(&self, did: &str) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: i64 = conn.sadd(self.tracked_key(), did).await?;
        Ok(())
    }

    async fn remove_tracked_actor(&self, did: &str) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: i64 = conn.srem(self.tracked_key(), did).await?;
        Ok(())
    }

    async fn bulk_add_subscribers(&self, dids: &[String]) -> Result<()> {
        self.add_members(&self.subscribers_key(), dids).await
    }

    async fn bulk_add_tracked_actors(&self, dids: &[String]) -> Result<()> {
        self.add_members(&self.tracked_key(), dids).await
    }

    async fn clear(&self) -> Result<()> {
        let mut conn = self.handle().lock().await;
        let _: i64 = conn.del(&[self.subscribers_key(), self.tracked_key()]).await?;
        Ok(())
    }
}

/// In-process double with the same contract, for tests and single-node dev.
#[derive(Default)]
pub struct MemoryMembershipCache {
    subscribers: RwLock<HashSet<String>>,
    tracked: RwLock<HashSet<String>>,
}

impl MemoryMembershipCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MembershipCache for MemoryMembershipCache {
    async fn is_subscriber(&self, did: &str) -> Result<bool> {
        Ok(self.subscribers.read().unwrap().contains(did))
    }

    async fn has_subscriber(&self, dids: &[String]) -> Result<bool> {
        let set = self.subscribers.read().unwrap();
        Ok(dids.iter().any(|d| set.contains(d)))
    }

    async fn is_tracked_actor(&self, did: &str) -> Result<bool> {
        Ok(self.tracked.read().unwrap().contains(did))
    }

    async fn has_tracked_actor(&self, dids: &[String]) -> Result<bool> {
        let set = self.tracked.read().unwrap();
        Ok(dids.iter().any(|d| set.contains(d)))
    }

    async fn add_subscriber(&self, did: &str) -> Result<()> {
        self.subscribers.write().unwrap().insert(did.to_string());
        Ok(())
    }

    async fn remove_subscriber(&self, did: &str) -> Result<()> {
        self.subscribers.write().unwrap().remove(did);
        Ok(())
    }

    async fn add_tracked_actor(&self, did: &str) -> Result<()> {
        self.tracked.write().unwrap().insert(did.to_string());
        Ok(())
    }

    async fn remove_tracked_actor(&self, did: &str) -> Result<()> {
        self.tracked.write().unwrap().remove(did);
        Ok(())
    }

    async fn bulk_add_subscribers(&self, dids: &[String]) -> Result<()> {
        let mut set = self.subscribers.write().unwrap();
        for did in dids {
            set.insert(did.clone());
        }
        Ok(())
    }

    async fn bulk_add_tracked_actors(&self, dids: &[String]) -> Result<()> {
        let mut set = self.tracked.write().unwrap();
        for did in dids {
            set.insert(did.clone());
        }
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.subscribers.write().unwrap().clear();
        self.tracked.write().unwrap().clear();
        Ok(())
    }
}
