/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::record::{
    Collection, FollowView, GeneratorView, LikeView, PostView, ProfileView, Record, RepostView,
    SubscriptionView,
};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Per-actor repo-sync state machine. `Failed` is reachable from any state;
/// everything else moves dirty -> in_process -> ready -> synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillStatus {
    Dirty,
    InProcess,
    Ready,
    Synchronized,
    Failed,
}

impl BackfillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dirty => "dirty",
            Self::InProcess => "in_process",
            Self::Ready => "ready",
            Self::Synchronized => "synchronized",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(input: &str) -> Option<Self> {
        match input {
            "dirty" => Some(Self::Dirty),
            "in_process" => Some(Self::InProcess),
            "ready" => Some(Self::Ready),
            "synchronized" => Some(Self::Synchronized),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ActorRow {
    pub did: String,
    pub handle: Option<String>,
    pub backfill_status: BackfillStatus,
    pub indexed_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct RecordRow {
    pub uri: String,
    pub cid: String,
    pub collection: Collection,
    pub did: String,
    pub json: Value,
    pub indexed_at_ms: i64,
}

impl RecordRow {
    /// Rehydrates the record the router originally indexed, used to drive
    /// stats recompute on delete.
    pub fn to_record(&self) -> Record {
        Record {
            uri: self.uri.clone(),
            cid: self.cid.clone(),
            collection: self.collection,
            did: self.did.clone(),
            json: self.json.clone(),
            indexed_at_ms: self.indexed_at_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InviteCodeRow {
    pub code: String,
    pub created_at_ms: i64,
    pub expires_at_ms: Option<i64>,
    pub used_by: Option<String>,
    pub used_at_ms: Option<i64>,
}

impl InviteCodeRow {
    pub fn is_usable(&self, now_ms: i64) -> bool {
        self.used_by.is_none() && self.expires_at_ms.map(|e| e > now_ms).unwrap_or(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PostStatsRow {
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
    pub quote_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActorStatsRow {
    pub follows_count: i64,
    pub followers_count: i64,
    pub posts_count: i64,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRow {
    pub did: String,
    pub uri: String,
    pub instance: String,
    pub invite_code: String,
    pub indexed_at_ms: i64,
}

/// Relational store of truth. Reads here run outside any transaction; all
/// writes go through a [`StoreTx`] obtained from [`Store::begin`].
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    async fn get_actor(&self, did: &str) -> Result<Option<ActorRow>>;
    async fn get_record(&self, uri: &str) -> Result<Option<RecordRow>>;
    async fn post_exists(&self, uri: &str) -> Result<bool>;
    async fn get_subscription(&self, did: &str) -> Result<Option<SubscriptionRow>>;

    async fn get_invite_code(&self, code: &str) -> Result<Option<InviteCodeRow>>;
    async fn create_invite_code(&self, code: &str, expires_at_ms: Option<i64>) -> Result<()>;

    /// All subscriber DIDs, for the membership cache warm-up.
    async fn list_subscriber_dids(&self) -> Result<Vec<String>>;
    /// All DIDs followed by any subscriber, for the membership cache warm-up.
    async fn list_subscriber_followed_dids(&self) -> Result<Vec<String>>;

    async fn post_stats(&self, uri: &str) -> Result<Option<PostStatsRow>>;
    async fn actor_stats(&self, did: &str) -> Result<Option<ActorStatsRow>>;
    async fn count_collection(&self, collection: Collection) -> Result<i64>;
}

/// One database transaction. The router composes actor bootstrap, record
/// upsert, collection upsert, and stats recompute in a single transaction so
/// a failure anywhere rolls back with no orphaned rows. Every write is an
/// upsert keyed by URI (or DID), so redelivery is idempotent.
#[async_trait]
pub trait StoreTx: Send {
    /// Lazily materializes the actor row. Returns true when the row was
    /// created by this call.
    async fn ensure_actor(&mut self, did: &str) -> Result<bool>;
    async fn set_backfill_status(&mut self, did: &str, status: BackfillStatus) -> Result<()>;

    async fn upsert_record(&mut self, rec: &Record) -> Result<()>;
    async fn delete_record(&mut self, uri: &str) -> Result<()>;
    /// Deletes the collection-specific rows for a URI. Unknown URIs are a
    /// no-op.
    async fn delete_collection_rows(&mut self, collection: Collection, uri: &str) -> Result<()>;

    async fn upsert_post(&mut self, rec: &Record, post: &PostView) -> Result<()>;
    async fn upsert_like(&mut self, rec: &Record, like: &LikeView) -> Result<()>;
    async fn upsert_repost(&mut self, rec: &Record, repost: &RepostView) -> Result<()>;
    async fn upsert_follow(&mut self, rec: &Record, follow: &FollowView) -> Result<()>;
    async fn upsert_profile(&mut self, rec: &Record, profile: &ProfileView) -> Result<()>;
    async fn upsert_generator(&mut self, rec: &Record, generator: &GeneratorView) -> Result<()>;
    async fn upsert_subscription(&mut self, rec: &Record, sub: &SubscriptionView) -> Result<()>;

    async fn mark_invite_used(&mut self, code: &str, did: &str) -> Result<()>;

    /// Full recompute of a post's counters from the current edge set. If the
    /// post is gone the stats row is removed.
    async fn recompute_post_stats(&mut self, uri: &str) -> Result<()>;
    /// Full recompute of an actor's counters from the current edge set.
    async fn recompute_actor_stats(&mut self, did: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_status_round_trip() {
        for s in [
            BackfillStatus::Dirty,
            BackfillStatus::InProcess,
            BackfillStatus::Ready,
            BackfillStatus::Synchronized,
            BackfillStatus::Failed,
        ] {
            assert_eq!(BackfillStatus::from_str(s.as_str()), Some(s));
        }
        assert_eq!(BackfillStatus::from_str("unknown"), None);
    }

    #[test]
    fn invite_code_usability() {
        let fresh = InviteCodeRow {
            code: "k".into(),
            created_at_ms: 0,
            expires_at_ms: None,
            used_by: None,
            used_at_ms: None,
        };
        assert!(fresh.is_usable(1_000));

        let used = InviteCodeRow {
            used_by: Some("did:plc:x".into()),
            ..fresh.clone()
        };
        assert!(!used.is_usable(1_000));

        let expired = InviteCodeRow {
            expires_at_ms: Some(500),
            ..fresh
        };
        assert!(!expired.is_usable(1_000));
    }
}
