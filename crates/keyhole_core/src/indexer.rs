/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-collection persistence. Each indexer upserts its typed rows inside
//! the router's transaction and recomputes the affected counters afterwards.
//! Counters are always full COUNT recomputes over the current edge set,
//! never in-place increments, so a missed event cannot leave them drifted.

use crate::membership::MembershipCache;
use crate::queue::{WorkQueue, QUEUE_BACKFILL};
use crate::record::Record;
use crate::store::StoreTx;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[async_trait]
pub trait CollectionIndexer: Send + Sync {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()>;

    /// Refreshes derived counters for the subjects this record touches. Also
    /// invoked on delete, with the record rehydrated from the stored row, so
    /// counters reflect the removal.
    async fn update_stats(&self, _tx: &mut dyn StoreTx, _rec: &Record) -> Result<()> {
        Ok(())
    }
}

pub struct PostIndexer;

#[async_trait]
impl CollectionIndexer for PostIndexer {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let post = rec.post()?;
        tx.upsert_post(rec, &post).await
    }

    async fn update_stats(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let post = rec.post()?;
        tx.recompute_post_stats(&rec.uri).await?;
        tx.recompute_actor_stats(&rec.did).await?;
        if let Some(reply) = &post.reply {
            tx.recompute_post_stats(&reply.parent.uri).await?;
        }
        if let Some(quoted) = post.quote_uri() {
            tx.recompute_post_stats(&quoted).await?;
        }
        Ok(())
    }
}

pub struct LikeIndexer;

#[async_trait]
impl CollectionIndexer for LikeIndexer {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let like = rec.like()?;
        tx.upsert_like(rec, &like).await
    }

    async fn update_stats(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let like = rec.like()?;
        tx.recompute_post_stats(&like.subject.uri).await
    }
}

pub struct RepostIndexer;

#[async_trait]
impl CollectionIndexer for RepostIndexer {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let repost = rec.repost()?;
        tx.upsert_repost(rec, &repost).await
    }

    async fn update_stats(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let repost = rec.repost()?;
        tx.recompute_post_stats(&repost.subject.uri).await
    }
}

/// Follow edges feed the membership cache: a subscriber following someone
/// makes the followee a tracked actor, and newly tracked actors get a
/// backfill work item so their history becomes available.
pub struct FollowIndexer {
    cache: Arc<dyn MembershipCache>,
    queue: Arc<dyn WorkQueue>,
}

impl FollowIndexer {
    pub fn new(cache: Arc<dyn MembershipCache>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { cache, queue }
    }
}

#[async_trait]
impl CollectionIndexer for FollowIndexer {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let follow = rec.follow()?;
        tx.upsert_follow(rec, &follow).await?;

        if self.cache.is_subscriber(&rec.did).await?
            && !self.cache.is_tracked_actor(&follow.subject).await?
        {
            self.cache.add_tracked_actor(&follow.subject).await?;
            if let Err(e) = self
                .queue
                .enqueue(
                    QUEUE_BACKFILL,
                    &follow.subject,
                    json!({"did": follow.subject}),
                )
                .await
            {
                warn!("enqueue backfill for {} failed: {e:#}", follow.subject);
            }
        }
        Ok(())
    }

    async fn update_stats(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let follow = rec.follow()?;
        tx.recompute_actor_stats(&rec.did).await?;
        tx.recompute_actor_stats(&follow.subject).await
    }
}

pub struct ProfileIndexer;

#[async_trait]
impl CollectionIndexer for ProfileIndexer {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let profile = rec.profile()?;
        tx.upsert_profile(rec, &profile).await
    }
}

pub struct GeneratorIndexer;

#[async_trait]
impl CollectionIndexer for GeneratorIndexer {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let generator = rec.generator()?;
        tx.upsert_generator(rec, &generator).await
    }
}

/// A successful subscription consumes its invite code and promotes the actor
/// to subscriber (and tracked actor), then queues a backfill of its history.
pub struct SubscriptionIndexer {
    cache: Arc<dyn MembershipCache>,
    queue: Arc<dyn WorkQueue>,
}

impl SubscriptionIndexer {
    pub fn new(cache: Arc<dyn MembershipCache>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { cache, queue }
    }
}

#[async_trait]
impl CollectionIndexer for SubscriptionIndexer {
    async fn upsert(&self, tx: &mut dyn StoreTx, rec: &Record) -> Result<()> {
        let sub = rec.subscription()?;
        tx.upsert_subscription(rec, &sub).await?;
        tx.mark_invite_used(&sub.invite_code, &rec.did).await?;

        self.cache.add_subscriber(&rec.did).await?;
        self.cache.add_tracked_actor(&rec.did).await?;
        if let Err(e) = self
            .queue
            .enqueue(QUEUE_BACKFILL, &rec.did, json!({"did": rec.did}))
            .await
        {
            warn!("enqueue backfill for {} failed: {e:#}", rec.did);
        }
        Ok(())
    }
}
