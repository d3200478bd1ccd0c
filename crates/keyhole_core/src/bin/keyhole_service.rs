/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Composition root: wires the relational store, membership cache, work
//! queue, policy/indexer registry, and backfill runner, then consumes the
//! backfill queue until shutdown.

use anyhow::Result;
use keyhole_core::backfill::{BackfillRunner, HttpRepoFetcher};
use keyhole_core::config::IndexerConfig;
use keyhole_core::db::Db;
use keyhole_core::membership::{self, MembershipCache, RedisMembershipCache};
use keyhole_core::queue::{RedisWorkQueue, WorkQueue, QUEUE_BACKFILL};
use keyhole_core::router::{build_registry, RecordIndexer};
use keyhole_core::store::Store;
use keyhole_core::store_pg::PgStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();
    info!("keyhole indexer starting");

    let cfg = IndexerConfig::from_env()?;
    let db = Db::connect(&cfg).await?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(db));
    let cache: Arc<dyn MembershipCache> = Arc::new(
        RedisMembershipCache::connect(&cfg.redis_url, &cfg.redis_prefix, cfg.redis_pool_size)
            .await?,
    );
    let queue: Arc<dyn WorkQueue> = Arc::new(
        RedisWorkQueue::connect(&cfg.redis_url, &cfg.redis_prefix, cfg.redis_pool_size).await?,
    );

    if let Some(code) = cfg.bootstrap_invite.as_deref() {
        store.create_invite_code(code, None).await?;
        info!("bootstrap invite code ensured");
    }

    if cfg.warmup_on_start {
        membership::rebuild(cache.as_ref(), store.as_ref()).await?;
    }

    let registry = Arc::new(build_registry(
        store.clone(),
        cache.clone(),
        queue.clone(),
        &cfg.instance_did,
    ));
    let router = Arc::new(RecordIndexer::new(store.clone(), registry, queue.clone()));
    let http = reqwest::Client::new();
    let fetcher = Arc::new(HttpRepoFetcher::new(http, cfg.repo_host.clone()));
    let runner = BackfillRunner::new(
        store.clone(),
        router,
        fetcher,
        cfg.backfill_batch_size,
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let item = tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            item = queue.dequeue(QUEUE_BACKFILL) => item,
        };
        match item {
            Ok(Some(item)) => {
                let Some(did) = item.payload.get("did").and_then(|v| v.as_str()) else {
                    warn!("backfill item {} has no did, dropping", item.id);
                    continue;
                };
                info!("backfill starting for {did}");
                if let Err(e) = runner.run(did).await {
                    error!("backfill of {did} failed: {e:#}");
                }
            }
            Ok(None) => {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        info!("shutdown requested");
                        break;
                    }
                    _ = sleep(Duration::from_secs(cfg.backfill_poll_secs)) => {}
                }
            }
            Err(e) => {
                warn!("backfill queue poll failed: {e:#}");
                sleep(Duration::from_secs(cfg.backfill_poll_secs)).await;
            }
        }
    }
    Ok(())
}
