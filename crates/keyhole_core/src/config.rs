/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::Result;
use deadpool::managed::QueueMode;

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub db_url: String,
    pub pg_pool_max_size: usize,
    pub pg_pool_wait_ms: Option<u64>,
    pub pg_pool_create_timeout_ms: Option<u64>,
    pub pg_pool_recycle_timeout_ms: Option<u64>,
    pub pg_pool_queue_mode: QueueMode,
    pub pg_init_retries: usize,
    pub pg_init_backoff_ms: u64,
    pub redis_url: String,
    pub redis_prefix: String,
    pub redis_pool_size: usize,
    /// This instance's own identifier; subscription records must target it.
    pub instance_did: String,
    /// Origin repository host the backfill fetcher talks to.
    pub repo_host: String,
    pub backfill_batch_size: usize,
    pub backfill_poll_secs: u64,
    pub warmup_on_start: bool,
    /// Invite code ensured at startup so the first subscriber can register.
    pub bootstrap_invite: Option<String>,
}

impl IndexerConfig {
    pub fn from_env() -> Result<Self> {
        let db_url = std::env::var("KEYHOLE_DB_URL")
            .map_err(|_| anyhow::anyhow!("KEYHOLE_DB_URL is required"))?;
        let pg_pool_max_size = std::env::var("KEYHOLE_PG_POOL_MAX_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(16)
            .max(1)
            .min(256);
        let pg_pool_wait_ms = std::env::var("KEYHOLE_PG_POOL_WAIT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());
        let pg_pool_create_timeout_ms = std::env::var("KEYHOLE_PG_POOL_CREATE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());
        let pg_pool_recycle_timeout_ms = std::env::var("KEYHOLE_PG_POOL_RECYCLE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());
        let pg_pool_queue_mode = std::env::var("KEYHOLE_PG_POOL_QUEUE_MODE")
            .ok()
            .and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
                "fifo" => Some(QueueMode::Fifo),
                "lifo" => Some(QueueMode::Lifo),
                _ => None,
            })
            .unwrap_or(QueueMode::Fifo);
        let pg_init_retries = std::env::var("KEYHOLE_PG_INIT_RETRIES")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(30)
            .max(1)
            .min(300);
        let pg_init_backoff_ms = std::env::var("KEYHOLE_PG_INIT_BACKOFF_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(500)
            .max(50)
            .min(30_000);
        let redis_url = std::env::var("KEYHOLE_REDIS_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow::anyhow!("KEYHOLE_REDIS_URL is required"))?;
        let redis_prefix = std::env::var("KEYHOLE_REDIS_PREFIX")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "keyhole".to_string());
        let redis_pool_size = std::env::var("KEYHOLE_REDIS_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4)
            .max(1)
            .min(64);
        let instance_did = std::env::var("KEYHOLE_INSTANCE_DID")
            .map_err(|_| anyhow::anyhow!("KEYHOLE_INSTANCE_DID is required"))?;
        let repo_host = std::env::var("KEYHOLE_REPO_HOST")
            .ok()
            .map(|v| v.trim_end_matches('/').to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "https://bsky.social".to_string());
        let backfill_batch_size = std::env::var("KEYHOLE_BACKFILL_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(50)
            .max(1)
            .min(500);
        let backfill_poll_secs = std::env::var("KEYHOLE_BACKFILL_POLL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(2)
            .max(1)
            .min(600);
        let warmup_on_start = std::env::var("KEYHOLE_WARMUP_ON_START")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let bootstrap_invite = std::env::var("KEYHOLE_BOOTSTRAP_INVITE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        Ok(Self {
            db_url,
            pg_pool_max_size,
            pg_pool_wait_ms,
            pg_pool_create_timeout_ms,
            pg_pool_recycle_timeout_ms,
            pg_pool_queue_mode,
            pg_init_retries,
            pg_init_backoff_ms,
            redis_url,
            redis_prefix,
            redis_pool_size,
            instance_did,
            repo_host,
            backfill_batch_size,
            backfill_poll_secs,
            warmup_on_start,
            bootstrap_invite,
        })
    }
}
