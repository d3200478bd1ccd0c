/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Follow-up work items the engine hands to external consumers: handle
//! resolution, profile fetch, repo backfill. Items are keyed by queue name
//! and a dedupe key; delivery semantics beyond at-least-once are the
//! consumer's concern.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{rngs::OsRng, RngCore};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::Mutex;

pub const QUEUE_RESOLVE_HANDLE: &str = "resolve_handle";
pub const QUEUE_FETCH_PROFILE: &str = "fetch_profile";
pub const QUEUE_BACKFILL: &str = "backfill_repo";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkItem {
    pub id: String,
    pub dedupe_key: String,
    pub payload: serde_json::Value,
}

fn new_item_id() -> String {
    // 16 random bytes -> 32 hex chars
    let mut b = [0u8; 16];
    OsRng.fill_bytes(&mut b);
    b.iter().map(|v| format!("{v:02x}")).collect()
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueues an item unless one with the same dedupe key is already
    /// pending on that queue. Returns false when deduplicated.
    async fn enqueue(
        &self,
        queue: &str,
        dedupe_key: &str,
        payload: serde_json::Value,
    ) -> Result<bool>;

    /// Pops the oldest pending item, releasing its dedupe key so the same
    /// work can be enqueued again later.
    async fn dequeue(&self, queue: &str) -> Result<Option<WorkItem>>;
}

pub struct RedisWorkQueue {
    conns: Vec<Mutex<ConnectionManager>>,
    next: AtomicUsize,
    prefix: String,
}

impl RedisWorkQueue {
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

    fn list_key(&self, queue: &str) -> String {
        format!("{}:queue:{}", self.prefix, queue)
    }

    fn seen_key(&self, queue: &str) -> String {
        format!("{}:queue:{}:seen", self.prefix, queue)
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(
        &self,
        queue: &str,
        dedupe_key: &str,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let item = WorkItem {
            id: new_item_id(),
            dedupe_key: dedupe_key.to_string(),
            payload,
        };
        let body = serde_json::to_string(&item)?;
        let mut conn = self.handle().lock().await;
        let fresh: i64 = conn.sadd(self.seen_key(queue), dedupe_key).await?;
        if fresh == 0 {
            return Ok(false);
        }
        let _: i64 = conn.lpush(self.list_key(queue), body).await?;
        Ok(true)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<WorkItem>> {
        let mut conn = self.handle().lock().await;
        let body: Option<String> = conn.rpop(self.list_key(queue), None).await?;
        let Some(body) = body else {
            return Ok(None);
        };
        let item: WorkItem =
            serde_json::from_str(&body).with_context(|| format!("bad work item on {queue}"))?;
        let _: i64 = conn.srem(self.seen_key(queue), &item.dedupe_key).await?;
        Ok(Some(item))
    }
}

#[derive(Default)]
struct MemoryQueueState {
    items: HashMap<String, VecDeque<WorkItem>>,
    seen: HashMap<String, HashSet<String>>,
}

/// In-process double for tests.
#[derive(Default)]
pub struct MemoryWorkQueue {
    state: StdMutex<MemoryQueueState>,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, queue: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .items
            .get(queue)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn enqueue(
        &self,
        queue: &str,
        dedupe_key: &str,
        payload: serde_json::Value,
    ) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let seen = state.seen.entry(queue.to_string()).or_default();
        if !seen.insert(dedupe_key.to_string()) {
            return Ok(false);
        }
        state
            .items
            .entry(queue.to_string())
            .or_default()
            .push_back(WorkItem {
                id: new_item_id(),
                dedupe_key: dedupe_key.to_string(),
                payload,
            });
        Ok(true)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<WorkItem>> {
        let mut state = self.state.lock().unwrap();
        let item = state
            .items
            .get_mut(queue)
            .and_then(|q| q.pop_front());
        if let Some(item) = &item {
            if let Some(seen) = state.seen.get_mut(queue) {
                seen.remove(&item.dedupe_key);
            }
        }
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn enqueue_dedupes_pending_items() {
        let queue = MemoryWorkQueue::new();
        assert!(queue
            .enqueue(QUEUE_BACKFILL, "did:plc:a", json!({"did": "did:plc:a"}))
            .await
            .unwrap());
        assert!(!queue
            .enqueue(QUEUE_BACKFILL, "did:plc:a", json!({"did": "did:plc:a"}))
            .await
            .unwrap());
        assert_eq!(queue.pending(QUEUE_BACKFILL), 1);

        let item = queue.dequeue(QUEUE_BACKFILL).await.unwrap().unwrap();
        assert_eq!(item.dedupe_key, "did:plc:a");
        assert!(queue.dequeue(QUEUE_BACKFILL).await.unwrap().is_none());

        // Dequeued items release their dedupe key.
        assert!(queue
            .enqueue(QUEUE_BACKFILL, "did:plc:a", json!({"did": "did:plc:a"}))
            .await
            .unwrap());
    }
}
