/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Commit-level record router: resolves the policy/indexer pair for a
//! record's collection and performs the transactional write. Actor
//! bootstrap, the generic record row, the collection rows, and the stats
//! recompute all land in one transaction per commit (or per backfill batch).

use crate::indexer::{
    CollectionIndexer, FollowIndexer, GeneratorIndexer, LikeIndexer, PostIndexer, ProfileIndexer,
    RepostIndexer, SubscriptionIndexer,
};
use crate::membership::MembershipCache;
use crate::policy::{
    FollowPolicy, GeneratorPolicy, IndexPolicy, PostPolicy, ProfilePolicy, SubjectPolicy,
    SubscriptionPolicy,
};
use crate::queue::{WorkQueue, QUEUE_FETCH_PROFILE, QUEUE_RESOLVE_HANDLE};
use crate::record::{Collection, Record};
use crate::store::{Store, StoreTx};
use anyhow::{bail, Context, Result};
use keyhole_protocol::{CommitEvent, CommitOp};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RegistryEntry {
    pub policy: Arc<dyn IndexPolicy>,
    pub indexer: Arc<dyn CollectionIndexer>,
}

/// Collection -> {policy, indexer} map, resolved once at startup.
pub struct IndexerRegistry {
    entries: HashMap<Collection, RegistryEntry>,
}

impl IndexerRegistry {
    pub fn get(&self, collection: Collection) -> Option<&RegistryEntry> {
        self.entries.get(&collection)
    }
}

/// Wires the default policy/indexer pair for every supported collection.
pub fn build_registry(
    store: Arc<dyn Store>,
    cache: Arc<dyn MembershipCache>,
    queue: Arc<dyn WorkQueue>,
    instance_did: &str,
) -> IndexerRegistry {
    let mut entries: HashMap<Collection, RegistryEntry> = HashMap::new();
    entries.insert(
        Collection::Post,
        RegistryEntry {
            policy: Arc::new(PostPolicy::new(store.clone(), cache.clone())),
            indexer: Arc::new(PostIndexer),
        },
    );
    entries.insert(
        Collection::Like,
        RegistryEntry {
            policy: Arc::new(SubjectPolicy::new(store.clone(), cache.clone())),
            indexer: Arc::new(LikeIndexer),
        },
    );
    entries.insert(
        Collection::Repost,
        RegistryEntry {
            policy: Arc::new(SubjectPolicy::new(store.clone(), cache.clone())),
            indexer: Arc::new(RepostIndexer),
        },
    );
    entries.insert(
        Collection::Follow,
        RegistryEntry {
            policy: Arc::new(FollowPolicy::new(cache.clone())),
            indexer: Arc::new(FollowIndexer::new(cache.clone(), queue.clone())),
        },
    );
    entries.insert(
        Collection::Profile,
        RegistryEntry {
            policy: Arc::new(ProfilePolicy::new(store.clone(), cache.clone())),
            indexer: Arc::new(ProfileIndexer),
        },
    );
    entries.insert(
        Collection::Generator,
        RegistryEntry {
            policy: Arc::new(GeneratorPolicy::new(cache.clone())),
            indexer: Arc::new(GeneratorIndexer),
        },
    );
    entries.insert(
        Collection::Subscription,
        RegistryEntry {
            policy: Arc::new(SubscriptionPolicy::new(store.clone(), instance_did.to_string())),
            indexer: Arc::new(SubscriptionIndexer::new(cache, queue)),
        },
    );
    IndexerRegistry { entries }
}

pub struct RecordIndexer {
    store: Arc<dyn Store>,
    registry: Arc<IndexerRegistry>,
    queue: Arc<dyn WorkQueue>,
}

impl RecordIndexer {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<IndexerRegistry>,
        queue: Arc<dyn WorkQueue>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
        }
    }

    /// Entry point for the ingest transport: applies one decoded commit.
    pub async fn handle_commit(&self, evt: &CommitEvent) -> Result<()> {
        match evt.op {
            CommitOp::Create | CommitOp::Update => {
                let body = evt
                    .record
                    .clone()
                    .with_context(|| format!("commit without record body: {}", evt.uri))?;
                let cid = evt.cid.as_deref().unwrap_or_default();
                let rec = Record::from_parts(&evt.uri, cid, body)?;
                self.upsert(&rec, false).await
            }
            CommitOp::Delete => self.delete(&evt.uri).await,
        }
    }

    /// Indexes one create/update commit. `force` bypasses the retention
    /// policy; backfill uses it because a relevant actor's whole history is
    /// retained, not just what the live policy would accept record-by-record.
    pub async fn upsert(&self, rec: &Record, force: bool) -> Result<()> {
        self.upsert_many(std::slice::from_ref(rec), force).await
    }

    /// Indexes a batch of records inside a single transaction. This is
    /// backfill's unit of commit; a failure rolls back the whole batch.
    pub async fn upsert_many(&self, records: &[Record], force: bool) -> Result<()> {
        let mut accepted: Vec<&Record> = Vec::with_capacity(records.len());
        for rec in records {
            if self.registry.get(rec.collection).is_none() {
                bail!("unsupported collection: {}", rec.collection.nsid());
            }
            if rec.has_nul_byte() {
                warn!("record contains NUL byte, skipping: {}", rec.uri);
                continue;
            }
            if let Err(e) = rec.check_parses() {
                warn!("skipping malformed record: {e:#}");
                continue;
            }
            if !force {
                let entry = self.registry.get(rec.collection).unwrap();
                match entry.policy.should_index(rec).await {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!("policy rejected record: {}", rec.uri);
                        continue;
                    }
                    Err(e) => {
                        warn!("policy error, skipping record: {e:#}");
                        continue;
                    }
                }
            }
            accepted.push(rec);
        }
        if accepted.is_empty() {
            return Ok(());
        }

        let mut tx = self.store.begin().await?;
        let mut created_actors: Vec<String> = Vec::new();
        for rec in &accepted {
            let entry = self.registry.get(rec.collection).unwrap();
            match Self::apply_record(tx.as_mut(), entry, rec).await {
                Ok(created) => {
                    if created {
                        created_actors.push(rec.did.clone());
                    }
                }
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            }
        }
        tx.commit().await?;

        for did in created_actors {
            self.enqueue_actor_bootstrap(&did).await;
        }
        Ok(())
    }

    async fn apply_record(
        tx: &mut dyn StoreTx,
        entry: &RegistryEntry,
        rec: &Record,
    ) -> Result<bool> {
        let created = tx.ensure_actor(&rec.did).await?;
        tx.upsert_record(rec).await?;
        entry.indexer.upsert(tx, rec).await?;
        entry.indexer.update_stats(tx, rec).await?;
        Ok(created)
    }

    /// Removes a record. Unknown URIs are a no-op; for known records the
    /// collection rows are deleted first so the stats recompute observes the
    /// removal. Referencing rows are left alone (a deleted post's replies
    /// keep their dangling parent reference).
    pub async fn delete(&self, uri: &str) -> Result<()> {
        let Some(existing) = self.store.get_record(uri).await? else {
            debug!("delete of unindexed record is a no-op: {uri}");
            return Ok(());
        };
        let entry = self.registry.get(existing.collection);

        let mut tx = self.store.begin().await?;
        let res = async {
            tx.delete_collection_rows(existing.collection, uri).await?;
            tx.delete_record(uri).await?;
            if let Some(entry) = entry {
                let old = existing.to_record();
                if let Err(e) = entry.indexer.update_stats(tx.as_mut(), &old).await {
                    warn!("stats recompute after delete failed for {uri}: {e:#}");
                }
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;
        match res {
            Ok(()) => tx.commit().await,
            Err(e) => {
                tx.rollback().await?;
                Err(e)
            }
        }
    }

    async fn enqueue_actor_bootstrap(&self, did: &str) {
        for queue in [QUEUE_RESOLVE_HANDLE, QUEUE_FETCH_PROFILE] {
            if let Err(e) = self.queue.enqueue(queue, did, json!({"did": did})).await {
                warn!("enqueue {queue} for {did} failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::MemoryMembershipCache;
    use crate::queue::{MemoryWorkQueue, QUEUE_BACKFILL};
    use crate::store::PostStatsRow;
    use crate::store_mem::MemStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemStore>,
        cache: Arc<MemoryMembershipCache>,
        queue: Arc<MemoryWorkQueue>,
        router: RecordIndexer,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemStore::new());
        let cache = Arc::new(MemoryMembershipCache::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let registry = Arc::new(build_registry(
            store.clone(),
            cache.clone(),
            queue.clone(),
            "did:web:keyhole.example",
        ));
        let router = RecordIndexer::new(store.clone(), registry, queue.clone());
        Fixture {
            store,
            cache,
            queue,
            router,
        }
    }

    fn post(did: &str, rkey: &str, text: &str) -> Record {
        Record::from_parts(
            &format!("at://{did}/app.bsky.feed.post/{rkey}"),
            "cid1",
            json!({"text": text, "createdAt": "2026-01-01T00:00:00Z"}),
        )
        .unwrap()
    }

    fn like(did: &str, rkey: &str, subject: &str) -> Record {
        Record::from_parts(
            &format!("at://{did}/app.bsky.feed.like/{rkey}"),
            "cid1",
            json!({"subject": {"uri": subject, "cid": "c"}}),
        )
        .unwrap()
    }

    fn follow(did: &str, rkey: &str, subject: &str) -> Record {
        Record::from_parts(
            &format!("at://{did}/app.bsky.graph.follow/{rkey}"),
            "cid1",
            json!({"subject": subject}),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_is_idempotent() {
        let f = fixture();
        f.cache.add_tracked_actor("did:plc:a").await.unwrap();

        let rec = post("did:plc:a", "1", "hello");
        f.router.upsert(&rec, false).await.unwrap();
        f.router.upsert(&rec, false).await.unwrap();

        assert_eq!(f.store.count_collection(Collection::Post).await.unwrap(), 1);
        let stats = f.store.actor_stats("did:plc:a").await.unwrap().unwrap();
        assert_eq!(stats.posts_count, 1);
    }

    #[tokio::test]
    async fn nul_byte_record_is_skipped_without_error() {
        let f = fixture();
        f.cache.add_tracked_actor("did:plc:a").await.unwrap();

        let rec = Record::from_parts(
            "at://did:plc:a/app.bsky.feed.post/1",
            "cid1",
            json!({"text": "bad\u{0000}byte"}),
        )
        .unwrap();
        f.router.upsert(&rec, false).await.unwrap();
        assert_eq!(f.store.count_collection(Collection::Post).await.unwrap(), 0);
        assert!(f.store.get_record(&rec.uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_record_writes_nothing() {
        let f = fixture();
        let rec = post("did:plc:nobody", "1", "shout into the void");
        f.router.upsert(&rec, false).await.unwrap();
        assert!(f.store.get_record(&rec.uri).await.unwrap().is_none());
        assert!(f.store.get_actor("did:plc:nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn force_bypasses_policy_only() {
        let f = fixture();
        let rec = post("did:plc:nobody", "1", "backfilled");
        f.router.upsert(&rec, true).await.unwrap();
        assert!(f.store.get_record(&rec.uri).await.unwrap().is_some());
        assert!(f.store.get_actor("did:plc:nobody").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn subscriber_follow_tracks_followee_and_their_posts() {
        // Scenario: subscriber S follows actor A (not otherwise tracked);
        // A posts.
        let f = fixture();
        f.cache.add_subscriber("did:plc:s").await.unwrap();
        f.cache.add_tracked_actor("did:plc:s").await.unwrap();

        f.router
            .upsert(&follow("did:plc:s", "1", "did:plc:a"), false)
            .await
            .unwrap();
        assert!(f.cache.is_tracked_actor("did:plc:a").await.unwrap());
        // Newly tracked actor gets queued for backfill.
        assert_eq!(f.queue.pending(QUEUE_BACKFILL), 1);

        let rec = post("did:plc:a", "1", "now visible");
        f.router.upsert(&rec, false).await.unwrap();
        assert!(f.store.post_exists(&rec.uri).await.unwrap());
    }

    #[tokio::test]
    async fn new_actor_enqueues_bootstrap_work() {
        let f = fixture();
        f.cache.add_tracked_actor("did:plc:a").await.unwrap();
        f.router.upsert(&post("did:plc:a", "1", "x"), false).await.unwrap();
        assert_eq!(f.queue.pending(QUEUE_RESOLVE_HANDLE), 1);
        assert_eq!(f.queue.pending(QUEUE_FETCH_PROFILE), 1);

        // Existing actors do not re-enqueue.
        f.router.upsert(&post("did:plc:a", "2", "y"), false).await.unwrap();
        assert_eq!(f.queue.pending(QUEUE_RESOLVE_HANDLE), 1);
    }

    #[tokio::test]
    async fn like_delete_recomputes_subject_stats() {
        let f = fixture();
        f.cache.add_tracked_actor("did:plc:a").await.unwrap();
        f.cache.add_tracked_actor("did:plc:b").await.unwrap();

        let subject = post("did:plc:a", "1", "likeable");
        f.router.upsert(&subject, false).await.unwrap();
        let like_rec = like("did:plc:b", "1", &subject.uri);
        f.router.upsert(&like_rec, false).await.unwrap();
        assert_eq!(
            f.store.post_stats(&subject.uri).await.unwrap().unwrap().like_count,
            1
        );

        f.router.delete(&like_rec.uri).await.unwrap();
        assert_eq!(
            f.store.post_stats(&subject.uri).await.unwrap().unwrap(),
            PostStatsRow::default()
        );
        assert!(f.store.get_record(&like_rec.uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn post_delete_leaves_replies_dangling() {
        let f = fixture();
        f.cache.add_tracked_actor("did:plc:a").await.unwrap();
        f.cache.add_tracked_actor("did:plc:b").await.unwrap();

        let parent = post("did:plc:a", "1", "parent");
        f.router.upsert(&parent, false).await.unwrap();
        let reply = Record::from_parts(
            "at://did:plc:b/app.bsky.feed.post/1",
            "cid1",
            json!({
                "text": "reply",
                "reply": {
                    "parent": {"uri": parent.uri, "cid": "c"},
                    "root": {"uri": parent.uri, "cid": "c"}
                }
            }),
        )
        .unwrap();
        f.router.upsert(&reply, false).await.unwrap();
        assert_eq!(
            f.store.post_stats(&parent.uri).await.unwrap().unwrap().reply_count,
            1
        );

        f.router.delete(&parent.uri).await.unwrap();
        // No cascading delete: the reply survives with a dangling parent.
        assert!(f.store.post_exists(&reply.uri).await.unwrap());
        assert!(f.store.post_stats(&parent.uri).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn handle_commit_dispatches_create_and_delete() {
        let f = fixture();
        f.cache.add_tracked_actor("did:plc:a").await.unwrap();

        let uri = "at://did:plc:a/app.bsky.feed.post/1".to_string();
        let create = CommitEvent {
            op: CommitOp::Create,
            uri: uri.clone(),
            cid: Some("cid1".into()),
            record: Some(json!({"text": "via commit"})),
            time: None,
        };
        f.router.handle_commit(&create).await.unwrap();
        assert!(f.store.post_exists(&uri).await.unwrap());

        let delete = CommitEvent {
            op: CommitOp::Delete,
            uri: uri.clone(),
            cid: None,
            record: None,
            time: None,
        };
        f.router.handle_commit(&delete).await.unwrap();
        assert!(!f.store.post_exists(&uri).await.unwrap());
    }

    #[tokio::test]
    async fn resubmission_after_tracking_is_accepted() {
        // Policies are monotone per collection: once the cache tracks an
        // actor, a previously rejected record passes on resubmission.
        let f = fixture();
        let rec = post("did:plc:a", "1", "early post");
        f.router.upsert(&rec, false).await.unwrap();
        assert!(f.store.get_record(&rec.uri).await.unwrap().is_none());

        f.cache.add_tracked_actor("did:plc:a").await.unwrap();
        f.router.upsert(&rec, false).await.unwrap();
        assert!(f.store.get_record(&rec.uri).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_of_unindexed_uri_is_noop() {
        let f = fixture();
        f.router
            .delete("at://did:plc:a/app.bsky.feed.post/never")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn subscription_consumes_invite_and_promotes_actor() {
        let f = fixture();
        f.store.create_invite_code("welcome-1", None).await.unwrap();

        let rec = Record::from_parts(
            "at://did:plc:new/social.keyhole.subscription/self",
            "cid1",
            json!({"instance": "did:web:keyhole.example", "inviteCode": "welcome-1"}),
        )
        .unwrap();
        f.router.upsert(&rec, false).await.unwrap();

        assert!(f.cache.is_subscriber("did:plc:new").await.unwrap());
        assert!(f.cache.is_tracked_actor("did:plc:new").await.unwrap());
        let invite = f.store.get_invite_code("welcome-1").await.unwrap().unwrap();
        assert_eq!(invite.used_by.as_deref(), Some("did:plc:new"));

        // Scenario: another actor reuses the consumed code.
        let reuse = Record::from_parts(
            "at://did:plc:late/social.keyhole.subscription/self",
            "cid1",
            json!({"instance": "did:web:keyhole.example", "inviteCode": "welcome-1"}),
        )
        .unwrap();
        f.router.upsert(&reuse, false).await.unwrap();
        assert!(!f.cache.is_subscriber("did:plc:late").await.unwrap());
        assert!(f.store.get_subscription("did:plc:late").await.unwrap().is_none());
    }
}
