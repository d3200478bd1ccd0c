/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-collection retention decisions. Each policy answers "is this record
//! worth storing" from the membership cache and, where a subject matters, a
//! direct existence lookup. Policies run once, before persistence; an
//! accepted record stays indexed even if the graph later changes, and a
//! rejected one is only revisited through backfill.

use crate::membership::MembershipCache;
use crate::record::{now_ms, Collection, Record};
use crate::store::Store;
use anyhow::Result;
use async_trait::async_trait;
use keyhole_protocol::AtUri;
use std::sync::Arc;

#[async_trait]
pub trait IndexPolicy: Send + Sync {
    async fn should_index(&self, rec: &Record) -> Result<bool>;
}

/// Posts by a subscriber or tracked actor are kept. Replies additionally
/// need either a locally indexed parent/root, or a parent/root *author* who
/// is tracked — the author check works from the URI alone so the decision
/// does not depend on the parent row existing.
pub struct PostPolicy {
    store: Arc<dyn Store>,
    cache: Arc<dyn MembershipCache>,
}

impl PostPolicy {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn MembershipCache>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl IndexPolicy for PostPolicy {
    async fn should_index(&self, rec: &Record) -> Result<bool> {
        let post = rec.post()?;

        let Some(reply) = &post.reply else {
            return Ok(self.cache.is_subscriber(&rec.did).await?
                || self.cache.is_tracked_actor(&rec.did).await?);
        };

        if self.cache.is_tracked_actor(&rec.did).await?
            && (self.store.post_exists(&reply.parent.uri).await?
                || self.store.post_exists(&reply.root.uri).await?)
        {
            return Ok(true);
        }

        let mut authors = Vec::new();
        for uri in [&reply.parent.uri, &reply.root.uri] {
            if let Some(at) = AtUri::parse(uri) {
                authors.push(at.did);
            }
        }
        self.cache.has_tracked_actor(&authors).await
    }
}

/// Likes and reposts share a shape: keep when the actor is tracked, or when
/// the subject post is already indexed, or when the subject's URI-derived
/// author is tracked.
pub struct SubjectPolicy {
    store: Arc<dyn Store>,
    cache: Arc<dyn MembershipCache>,
}

impl SubjectPolicy {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn MembershipCache>) -> Self {
        Self { store, cache }
    }

    async fn decide(&self, rec: &Record, subject_uri: &str) -> Result<bool> {
        if self.cache.is_tracked_actor(&rec.did).await? {
            return Ok(true);
        }
        if self.store.post_exists(subject_uri).await? {
            return Ok(true);
        }
        match AtUri::parse(subject_uri) {
            Some(at) => self.cache.is_tracked_actor(&at.did).await,
            None => Ok(false),
        }
    }
}

#[async_trait]
impl IndexPolicy for SubjectPolicy {
    async fn should_index(&self, rec: &Record) -> Result<bool> {
        let subject_uri = match rec.collection {
            Collection::Like => rec.like()?.subject.uri,
            _ => rec.repost()?.subject.uri,
        };
        self.decide(rec, &subject_uri).await
    }
}

/// A follow edge is kept when either endpoint is a subscriber, so both "who
/// I follow" and "who follows me" stay visible for subscribers.
pub struct FollowPolicy {
    cache: Arc<dyn MembershipCache>,
}

impl FollowPolicy {
    pub fn new(cache: Arc<dyn MembershipCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl IndexPolicy for FollowPolicy {
    async fn should_index(&self, rec: &Record) -> Result<bool> {
        let follow = rec.follow()?;
        self.cache
            .has_subscriber(&[rec.did.clone(), follow.subject])
            .await
    }
}

/// Feed generators are not fanned out through the follow graph: only a
/// subscriber's own generators are kept.
pub struct GeneratorPolicy {
    cache: Arc<dyn MembershipCache>,
}

impl GeneratorPolicy {
    pub fn new(cache: Arc<dyn MembershipCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl IndexPolicy for GeneratorPolicy {
    async fn should_index(&self, rec: &Record) -> Result<bool> {
        self.cache.is_subscriber(&rec.did).await
    }
}

/// Profiles carry no independent gate: any actor already present locally or
/// tracked gets its profile processed.
pub struct ProfilePolicy {
    store: Arc<dyn Store>,
    cache: Arc<dyn MembershipCache>,
}

impl ProfilePolicy {
    pub fn new(store: Arc<dyn Store>, cache: Arc<dyn MembershipCache>) -> Self {
        Self { store, cache }
    }
}

#[async_trait]
impl IndexPolicy for ProfilePolicy {
    async fn should_index(&self, rec: &Record) -> Result<bool> {
        if self.store.get_actor(&rec.did).await?.is_some() {
            return Ok(true);
        }
        self.cache.is_tracked_actor(&rec.did).await
    }
}

/// Subscriptions must target this instance and reference an invite code that
/// exists, is unused, and is unexpired.
pub struct SubscriptionPolicy {
    store: Arc<dyn Store>,
    instance_did: String,
}

impl SubscriptionPolicy {
    pub fn new(store: Arc<dyn Store>, instance_did: String) -> Self {
        Self {
            store,
            instance_did,
        }
    }
}

#[async_trait]
impl IndexPolicy for SubscriptionPolicy {
    async fn should_index(&self, rec: &Record) -> Result<bool> {
        let sub = rec.subscription()?;
        if sub.instance != self.instance_did {
            return Ok(false);
        }
        let Some(invite) = self.store.get_invite_code(&sub.invite_code).await? else {
            return Ok(false);
        };
        Ok(invite.is_usable(now_ms()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemoryMembershipCache;
    use crate::store::StoreTx;
    use crate::store_mem::MemStore;
    use serde_json::json;

    fn post(did: &str, rkey: &str, body: serde_json::Value) -> Record {
        Record::from_parts(
            &format!("at://{did}/app.bsky.feed.post/{rkey}"),
            "cid",
            body,
        )
        .unwrap()
    }

    async fn seed_post(store: &MemStore, rec: &Record) {
        let mut tx = store.begin().await.unwrap();
        tx.ensure_actor(&rec.did).await.unwrap();
        tx.upsert_record(rec).await.unwrap();
        let view = rec.post().unwrap();
        tx.upsert_post(rec, &view).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn tracked_author_post_is_kept() {
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(MemoryMembershipCache::new());
        cache.add_tracked_actor("did:plc:a").await.unwrap();

        let policy = PostPolicy::new(store, cache);
        let kept = post("did:plc:a", "1", json!({"text": "hi"}));
        let dropped = post("did:plc:b", "1", json!({"text": "hi"}));
        assert!(policy.should_index(&kept).await.unwrap());
        assert!(!policy.should_index(&dropped).await.unwrap());
    }

    #[tokio::test]
    async fn untracked_reply_to_tracked_author_is_kept() {
        // Scenario: actor B (untracked) replies to a post authored by tracked
        // actor A.
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(MemoryMembershipCache::new());
        cache.add_tracked_actor("did:plc:a").await.unwrap();

        let policy = PostPolicy::new(store, cache);
        let reply = post(
            "did:plc:b",
            "1",
            json!({
                "text": "reply",
                "reply": {
                    "parent": {"uri": "at://did:plc:a/app.bsky.feed.post/9", "cid": "c"},
                    "root": {"uri": "at://did:plc:a/app.bsky.feed.post/9", "cid": "c"}
                }
            }),
        );
        assert!(policy.should_index(&reply).await.unwrap());
    }

    #[tokio::test]
    async fn reply_without_local_parent_or_tracked_author_is_rejected() {
        // Even a tracked replier is rejected when the parent is absent and
        // its author untracked.
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(MemoryMembershipCache::new());
        cache.add_tracked_actor("did:plc:c").await.unwrap();

        let policy = PostPolicy::new(store.clone(), cache.clone());
        let reply = post(
            "did:plc:c",
            "1",
            json!({
                "text": "reply",
                "reply": {
                    "parent": {"uri": "at://did:plc:nobody/app.bsky.feed.post/9", "cid": "c"},
                    "root": {"uri": "at://did:plc:nobody/app.bsky.feed.post/9", "cid": "c"}
                }
            }),
        );
        assert!(!policy.should_index(&reply).await.unwrap());

        // Once the parent exists locally the tracked replier is accepted.
        let parent = post("did:plc:nobody", "9", json!({"text": "parent"}));
        seed_post(&store, &parent).await;
        assert!(policy.should_index(&reply).await.unwrap());
    }

    #[tokio::test]
    async fn like_needs_tracked_actor_or_known_subject() {
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(MemoryMembershipCache::new());
        let policy = SubjectPolicy::new(store.clone(), cache.clone());

        let like = Record::from_parts(
            "at://did:plc:x/app.bsky.feed.like/1",
            "cid",
            json!({"subject": {"uri": "at://did:plc:ghost/app.bsky.feed.post/1", "cid": "c"}}),
        )
        .unwrap();
        // Subject absent, implied author untracked, liker untracked.
        assert!(!policy.should_index(&like).await.unwrap());

        cache.add_tracked_actor("did:plc:ghost").await.unwrap();
        assert!(policy.should_index(&like).await.unwrap());

        cache.clear().await.unwrap();
        cache.add_tracked_actor("did:plc:x").await.unwrap();
        assert!(policy.should_index(&like).await.unwrap());
    }

    #[tokio::test]
    async fn follow_kept_when_either_endpoint_subscribes() {
        let cache = Arc::new(MemoryMembershipCache::new());
        cache.add_subscriber("did:plc:s").await.unwrap();
        let policy = FollowPolicy::new(cache);

        let outgoing = Record::from_parts(
            "at://did:plc:s/app.bsky.graph.follow/1",
            "cid",
            json!({"subject": "did:plc:other"}),
        )
        .unwrap();
        let incoming = Record::from_parts(
            "at://did:plc:other/app.bsky.graph.follow/1",
            "cid",
            json!({"subject": "did:plc:s"}),
        )
        .unwrap();
        let unrelated = Record::from_parts(
            "at://did:plc:a/app.bsky.graph.follow/1",
            "cid",
            json!({"subject": "did:plc:b"}),
        )
        .unwrap();
        assert!(policy.should_index(&outgoing).await.unwrap());
        assert!(policy.should_index(&incoming).await.unwrap());
        assert!(!policy.should_index(&unrelated).await.unwrap());
    }

    #[tokio::test]
    async fn generator_requires_subscriber_creator() {
        let cache = Arc::new(MemoryMembershipCache::new());
        cache.add_subscriber("did:plc:s").await.unwrap();
        cache.add_tracked_actor("did:plc:t").await.unwrap();
        let policy = GeneratorPolicy::new(cache);

        let by_subscriber = Record::from_parts(
            "at://did:plc:s/app.bsky.feed.generator/feed",
            "cid",
            json!({"did": "did:web:feeds.example", "displayName": "f"}),
        )
        .unwrap();
        let by_tracked = Record::from_parts(
            "at://did:plc:t/app.bsky.feed.generator/feed",
            "cid",
            json!({"did": "did:web:feeds.example", "displayName": "f"}),
        )
        .unwrap();
        assert!(policy.should_index(&by_subscriber).await.unwrap());
        assert!(!policy.should_index(&by_tracked).await.unwrap());
    }

    #[tokio::test]
    async fn subscription_checks_instance_and_invite() {
        let store = Arc::new(MemStore::new());
        store.create_invite_code("welcome-1", None).await.unwrap();
        let policy = SubscriptionPolicy::new(store.clone(), "did:web:keyhole.example".into());

        let ok = Record::from_parts(
            "at://did:plc:new/social.keyhole.subscription/self",
            "cid",
            json!({"instance": "did:web:keyhole.example", "inviteCode": "welcome-1"}),
        )
        .unwrap();
        assert!(policy.should_index(&ok).await.unwrap());

        let wrong_instance = Record::from_parts(
            "at://did:plc:new/social.keyhole.subscription/self",
            "cid",
            json!({"instance": "did:web:elsewhere.example", "inviteCode": "welcome-1"}),
        )
        .unwrap();
        assert!(!policy.should_index(&wrong_instance).await.unwrap());

        let unknown_code = Record::from_parts(
            "at://did:plc:new/social.keyhole.subscription/self",
            "cid",
            json!({"instance": "did:web:keyhole.example", "inviteCode": "nope"}),
        )
        .unwrap();
        assert!(!policy.should_index(&unknown_code).await.unwrap());

        // Scenario: the code was already consumed by another actor.
        let mut tx = store.begin().await.unwrap();
        tx.mark_invite_used("welcome-1", "did:plc:first").await.unwrap();
        tx.commit().await.unwrap();
        assert!(!policy.should_index(&ok).await.unwrap());
    }

    #[test]
    fn subject_policy_collection_dispatch() {
        // Guard the Like/Repost split in should_index.
        assert_eq!(Collection::from_nsid("app.bsky.feed.like"), Some(Collection::Like));
        assert_eq!(
            Collection::from_nsid("app.bsky.feed.repost"),
            Some(Collection::Repost)
        );
    }
}
