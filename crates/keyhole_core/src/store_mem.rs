/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! In-memory [`Store`] double: arena-style maps keyed by URI/DID behind the
//! same trait contract as the Postgres store. Used by tests and single-node
//! experiments; transactions snapshot the whole state and restore it on
//! rollback.

use crate::record::{
    now_ms, Collection, FollowView, GeneratorView, LikeView, PostView, ProfileView, Record,
    RepostView, SubscriptionView,
};
use crate::store::{
    ActorRow, ActorStatsRow, BackfillStatus, InviteCodeRow, PostStatsRow, RecordRow, Store,
    StoreTx, SubscriptionRow,
};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct PostRow {
    did: String,
    reply_parent: Option<String>,
    reply_root: Option<String>,
    quote_uri: Option<String>,
}

#[derive(Debug, Clone)]
struct SubjectRow {
    subject_uri: String,
}

#[derive(Debug, Clone)]
struct FollowRow {
    did: String,
    subject_did: String,
}

#[derive(Debug, Clone, Default)]
struct MemState {
    actors: HashMap<String, ActorRow>,
    records: HashMap<String, RecordRow>,
    posts: HashMap<String, PostRow>,
    likes: HashMap<String, SubjectRow>,
    reposts: HashMap<String, SubjectRow>,
    follows: HashMap<String, FollowRow>,
    profiles: HashSet<String>,
    generators: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionRow>,
    invite_codes: HashMap<String, InviteCodeRow>,
    post_stats: HashMap<String, PostStatsRow>,
    actor_stats: HashMap<String, ActorStatsRow>,
    op_log: Vec<String>,
}

impl MemState {
    fn recompute_post_stats(&mut self, uri: &str) {
        if !self.posts.contains_key(uri) {
            self.post_stats.remove(uri);
            return;
        }
        let stats = PostStatsRow {
            like_count: self.likes.values().filter(|l| l.subject_uri == uri).count() as i64,
            repost_count: self.reposts.values().filter(|r| r.subject_uri == uri).count() as i64,
            reply_count: self
                .posts
                .values()
                .filter(|p| p.reply_parent.as_deref() == Some(uri))
                .count() as i64,
            quote_count: self
                .posts
                .values()
                .filter(|p| p.quote_uri.as_deref() == Some(uri))
                .count() as i64,
        };
        self.post_stats.insert(uri.to_string(), stats);
    }

    fn recompute_actor_stats(&mut self, did: &str) {
        let stats = ActorStatsRow {
            follows_count: self.follows.values().filter(|f| f.did == did).count() as i64,
            followers_count: self.follows.values().filter(|f| f.subject_did == did).count() as i64,
            posts_count: self.posts.values().filter(|p| p.did == did).count() as i64,
        };
        self.actor_stats.insert(did.to_string(), stats);
    }
}

#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordered log of collection writes, as `"<kind> <uri>"` entries. Tests
    /// use it to assert replay ordering.
    pub fn op_log(&self) -> Vec<String> {
        self.state.lock().unwrap().op_log.clone()
    }

    pub fn follow_count(&self) -> usize {
        self.state.lock().unwrap().follows.len()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let snapshot = self.state.lock().unwrap().clone();
        Ok(Box::new(MemStoreTx {
            state: self.state.clone(),
            snapshot: Some(snapshot),
        }))
    }

    async fn get_actor(&self, did: &str) -> Result<Option<ActorRow>> {
        Ok(self.state.lock().unwrap().actors.get(did).cloned())
    }

    async fn get_record(&self, uri: &str) -> Result<Option<RecordRow>> {
        Ok(self.state.lock().unwrap().records.get(uri).cloned())
    }

    async fn post_exists(&self, uri: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().posts.contains_key(uri))
    }

    async fn get_subscription(&self, did: &str) -> Result<Option<SubscriptionRow>> {
        Ok(self.state.lock().unwrap().subscriptions.get(did).cloned())
    }

    async fn get_invite_code(&self, code: &str) -> Result<Option<InviteCodeRow>> {
        Ok(self.state.lock().unwrap().invite_codes.get(code).cloned())
    }

    async fn create_invite_code(&self, code: &str, expires_at_ms: Option<i64>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .invite_codes
            .entry(code.to_string())
            .or_insert_with(|| InviteCodeRow {
                code: code.to_string(),
                created_at_ms: now_ms(),
                expires_at_ms,
                used_by: None,
                used_at_ms: None,
            });
        Ok(())
    }

    async fn list_subscriber_dids(&self) -> Result<Vec<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .subscriptions
            .keys()
            .cloned()
            .collect())
    }

    async fn list_subscriber_followed_dids(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<String> = state
            .follows
            .values()
            .filter(|f| state.subscriptions.contains_key(&f.did))
            .map(|f| f.subject_did.clone())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }

    async fn post_stats(&self, uri: &str) -> Result<Option<PostStatsRow>> {
        Ok(self.state.lock().unwrap().post_stats.get(uri).cloned())
    }

    async fn actor_stats(&self, did: &str) -> Result<Option<ActorStatsRow>> {
        Ok(self.state.lock().unwrap().actor_stats.get(did).cloned())
    }

    async fn count_collection(&self, collection: Collection) -> Result<i64> {
        let state = self.state.lock().unwrap();
        let n = match collection {
            Collection::Post => state.posts.len(),
            Collection::Like => state.likes.len(),
            Collection::Repost => state.reposts.len(),
            Collection::Follow => state.follows.len(),
            Collection::Profile => state.profiles.len(),
            Collection::Generator => state.generators.len(),
            Collection::Subscription => state.subscriptions.len(),
        };
        Ok(n as i64)
    }
}

pub struct MemStoreTx {
    state: Arc<Mutex<MemState>>,
    snapshot: Option<MemState>,
}

#[async_trait]
impl StoreTx for MemStoreTx {
    async fn ensure_actor(&mut self, did: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.actors.contains_key(did) {
            return Ok(false);
        }
        state.actors.insert(
            did.to_string(),
            ActorRow {
                did: did.to_string(),
                handle: None,
                backfill_status: BackfillStatus::Dirty,
                indexed_at_ms: now_ms(),
            },
        );
        Ok(true)
    }

    async fn set_backfill_status(&mut self, did: &str, status: BackfillStatus) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(actor) = state.actors.get_mut(did) {
            actor.backfill_status = status;
        }
        Ok(())
    }

    async fn upsert_record(&mut self, rec: &Record) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.records.insert(
            rec.uri.clone(),
            RecordRow {
                uri: rec.uri.clone(),
                cid: rec.cid.clone(),
                collection: rec.collection,
                did: rec.did.clone(),
                json: rec.json.clone(),
                indexed_at_ms: rec.indexed_at_ms,
            },
        );
        Ok(())
    }

    async fn delete_record(&mut self, uri: &str) -> Result<()> {
        self.state.lock().unwrap().records.remove(uri);
        Ok(())
    }

    async fn delete_collection_rows(&mut self, collection: Collection, uri: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        match collection {
            Collection::Post => {
                state.posts.remove(uri);
            }
            Collection::Like => {
                state.likes.remove(uri);
            }
            Collection::Repost => {
                state.reposts.remove(uri);
            }
            Collection::Follow => {
                state.follows.remove(uri);
            }
            Collection::Profile => {
                state.profiles.remove(uri);
            }
            Collection::Generator => {
                state.generators.remove(uri);
            }
            Collection::Subscription => {
                state.subscriptions.retain(|_, s| s.uri != uri);
            }
        }
        Ok(())
    }

    async fn upsert_post(&mut self, rec: &Record, post: &PostView) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.posts.insert(
            rec.uri.clone(),
            PostRow {
                did: rec.did.clone(),
                reply_parent: post.reply.as_ref().map(|r| r.parent.uri.clone()),
                reply_root: post.reply.as_ref().map(|r| r.root.uri.clone()),
                quote_uri: post.quote_uri(),
            },
        );
        state.op_log.push(format!("post {}", rec.uri));
        Ok(())
    }

    async fn upsert_like(&mut self, rec: &Record, like: &LikeView) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.likes.insert(
            rec.uri.clone(),
            SubjectRow {
                subject_uri: like.subject.uri.clone(),
            },
        );
        state.op_log.push(format!("like {}", rec.uri));
        Ok(())
    }

    async fn upsert_repost(&mut self, rec: &Record, repost: &RepostView) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.reposts.insert(
            rec.uri.clone(),
            SubjectRow {
                subject_uri: repost.subject.uri.clone(),
            },
        );
        state.op_log.push(format!("repost {}", rec.uri));
        Ok(())
    }

    async fn upsert_follow(&mut self, rec: &Record, follow: &FollowView) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.follows.insert(
            rec.uri.clone(),
            FollowRow {
                did: rec.did.clone(),
                subject_did: follow.subject.clone(),
            },
        );
        state.op_log.push(format!("follow {}", rec.uri));
        Ok(())
    }

    async fn upsert_profile(&mut self, rec: &Record, _profile: &ProfileView) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.profiles.insert(rec.uri.clone());
        state.op_log.push(format!("profile {}", rec.uri));
        Ok(())
    }

    async fn upsert_generator(&mut self, rec: &Record, _generator: &GeneratorView) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.generators.insert(rec.uri.clone());
        state.op_log.push(format!("generator {}", rec.uri));
        Ok(())
    }

    async fn upsert_subscription(&mut self, rec: &Record, sub: &SubscriptionView) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.subscriptions.insert(
            rec.did.clone(),
            SubscriptionRow {
                did: rec.did.clone(),
                uri: rec.uri.clone(),
                instance: sub.instance.clone(),
                invite_code: sub.invite_code.clone(),
                indexed_at_ms: rec.indexed_at_ms,
            },
        );
        state.op_log.push(format!("subscription {}", rec.uri));
        Ok(())
    }

    async fn mark_invite_used(&mut self, code: &str, did: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(invite) = state.invite_codes.get_mut(code) {
            invite.used_by = Some(did.to_string());
            invite.used_at_ms = Some(now_ms());
        }
        Ok(())
    }

    async fn recompute_post_stats(&mut self, uri: &str) -> Result<()> {
        self.state.lock().unwrap().recompute_post_stats(uri);
        Ok(())
    }

    async fn recompute_actor_stats(&mut self, did: &str) -> Result<()> {
        self.state.lock().unwrap().recompute_actor_stats(did);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut this = self;
        this.snapshot = None;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let mut this = self;
        if let Some(snapshot) = this.snapshot.take() {
            *this.state.lock().unwrap() = snapshot;
        }
        Ok(())
    }
}
