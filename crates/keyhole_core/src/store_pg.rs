/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Postgres-backed [`Store`]. One indexing call spans one transaction; the
//! transaction object owns its pooled connection and drives BEGIN/COMMIT
//! explicitly so it can cross component boundaries.

use crate::db::Db;
use crate::record::{
    now_ms, Collection, FollowView, GeneratorView, LikeView, PostView, ProfileView, Record,
    RepostView, SubscriptionView,
};
use crate::store::{
    ActorRow, ActorStatsRow, BackfillStatus, InviteCodeRow, PostStatsRow, RecordRow, Store,
    StoreTx, SubscriptionRow,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_postgres::Row;

pub struct PgStore {
    db: Db,
}

impl PgStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

fn actor_from_row(row: &Row) -> Result<ActorRow> {
    let status: String = row.get(2);
    let backfill_status = BackfillStatus::from_str(&status)
        .with_context(|| format!("unknown backfill status: {status}"))?;
    Ok(ActorRow {
        did: row.get(0),
        handle: row.get(1),
        backfill_status,
        indexed_at_ms: row.get(3),
    })
}

fn record_from_row(row: &Row) -> Result<RecordRow> {
    let collection: String = row.get(3);
    let json: String = row.get(4);
    Ok(RecordRow {
        uri: row.get(0),
        cid: row.get(1),
        did: row.get(2),
        collection: Collection::from_nsid(&collection)
            .with_context(|| format!("unknown stored collection: {collection}"))?,
        json: serde_json::from_str(&json).context("stored record body")?,
        indexed_at_ms: row.get(5),
    })
}

fn invite_from_row(row: &Row) -> InviteCodeRow {
    InviteCodeRow {
        code: row.get(0),
        created_at_ms: row.get(1),
        expires_at_ms: row.get(2),
        used_by: row.get(3),
        used_at_ms: row.get(4),
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let client = self.db.conn().await?;
        client.batch_execute("BEGIN").await.context("begin tx")?;
        Ok(Box::new(PgStoreTx { client }))
    }

    async fn get_actor(&self, did: &str) -> Result<Option<ActorRow>> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_opt(
                "SELECT did, handle, backfill_status, indexed_at_ms FROM actors WHERE did = $1",
                &[&did],
            )
            .await?;
        row.as_ref().map(actor_from_row).transpose()
    }

    async fn get_record(&self, uri: &str) -> Result<Option<RecordRow>> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_opt(
                "SELECT uri, cid, did, collection, json, indexed_at_ms FROM records WHERE uri = $1",
                &[&uri],
            )
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn post_exists(&self, uri: &str) -> Result<bool> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_opt("SELECT 1 FROM posts WHERE uri = $1", &[&uri])
            .await?;
        Ok(row.is_some())
    }

    async fn get_subscription(&self, did: &str) -> Result<Option<SubscriptionRow>> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_opt(
                "SELECT did, uri, instance, invite_code, indexed_at_ms FROM subscriptions WHERE did = $1",
                &[&did],
            )
            .await?;
        Ok(row.map(|r| SubscriptionRow {
            did: r.get(0),
            uri: r.get(1),
            instance: r.get(2),
            invite_code: r.get(3),
            indexed_at_ms: r.get(4),
        }))
    }

    async fn get_invite_code(&self, code: &str) -> Result<Option<InviteCodeRow>> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_opt(
                "SELECT code, created_at_ms, expires_at_ms, used_by, used_at_ms FROM invite_codes WHERE code = $1",
                &[&code],
            )
            .await?;
        Ok(row.as_ref().map(invite_from_row))
    }

    async fn create_invite_code(&self, code: &str, expires_at_ms: Option<i64>) -> Result<()> {
        let conn = self.db.conn().await?;
        conn.execute(
            "INSERT INTO invite_codes(code, created_at_ms, expires_at_ms) VALUES ($1, $2, $3)
             ON CONFLICT(code) DO NOTHING",
            &[&code, &now_ms(), &expires_at_ms],
        )
        .await?;
        Ok(())
    }

    async fn list_subscriber_dids(&self) -> Result<Vec<String>> {
        let conn = self.db.conn().await?;
        let rows = conn.query("SELECT did FROM subscriptions", &[]).await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn list_subscriber_followed_dids(&self) -> Result<Vec<String>> {
        let conn = self.db.conn().await?;
        let rows = conn
            .query(
                "SELECT DISTINCT f.subject_did FROM follows f
                 JOIN subscriptions s ON s.did = f.did",
                &[],
            )
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn post_stats(&self, uri: &str) -> Result<Option<PostStatsRow>> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_opt(
                "SELECT like_count, repost_count, reply_count, quote_count FROM post_stats WHERE uri = $1",
                &[&uri],
            )
            .await?;
        Ok(row.map(|r| PostStatsRow {
            like_count: r.get(0),
            repost_count: r.get(1),
            reply_count: r.get(2),
            quote_count: r.get(3),
        }))
    }

    async fn actor_stats(&self, did: &str) -> Result<Option<ActorStatsRow>> {
        let conn = self.db.conn().await?;
        let row = conn
            .query_opt(
                "SELECT follows_count, followers_count, posts_count FROM actor_stats WHERE did = $1",
                &[&did],
            )
            .await?;
        Ok(row.map(|r| ActorStatsRow {
            follows_count: r.get(0),
            followers_count: r.get(1),
            posts_count: r.get(2),
        }))
    }

    async fn count_collection(&self, collection: Collection) -> Result<i64> {
        let table = match collection {
            Collection::Post => "posts",
            Collection::Like => "likes",
            Collection::Repost => "reposts",
            Collection::Follow => "follows",
            Collection::Profile => "profiles",
            Collection::Generator => "generators",
            Collection::Subscription => "subscriptions",
        };
        let conn = self.db.conn().await?;
        let stmt = format!("SELECT COUNT(*) FROM {table}");
        let row = conn.query_one(stmt.as_str(), &[]).await?;
        Ok(row.get(0))
    }
}

pub struct PgStoreTx {
    client: deadpool_postgres::Object,
}

#[async_trait]
impl StoreTx for PgStoreTx {
    async fn ensure_actor(&mut self, did: &str) -> Result<bool> {
        let n = self
            .client
            .execute(
                "INSERT INTO actors(did, backfill_status, indexed_at_ms) VALUES ($1, 'dirty', $2)
                 ON CONFLICT(did) DO NOTHING",
                &[&did, &now_ms()],
            )
            .await?;
        Ok(n > 0)
    }

    async fn set_backfill_status(&mut self, did: &str, status: BackfillStatus) -> Result<()> {
        self.client
            .execute(
                "UPDATE actors SET backfill_status = $2 WHERE did = $1",
                &[&did, &status.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn upsert_record(&mut self, rec: &Record) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO records(uri, cid, did, collection, json, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT(uri) DO UPDATE SET
                   cid = excluded.cid,
                   json = excluded.json,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.uri,
                    &rec.cid,
                    &rec.did,
                    &rec.collection.nsid(),
                    &rec.json.to_string(),
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_record(&mut self, uri: &str) -> Result<()> {
        self.client
            .execute("DELETE FROM records WHERE uri = $1", &[&uri])
            .await?;
        Ok(())
    }

    async fn delete_collection_rows(&mut self, collection: Collection, uri: &str) -> Result<()> {
        match collection {
            Collection::Post => {
                self.client
                    .execute("DELETE FROM post_embeds WHERE post_uri = $1", &[&uri])
                    .await?;
                self.client
                    .execute("DELETE FROM posts WHERE uri = $1", &[&uri])
                    .await?;
            }
            Collection::Like => {
                self.client
                    .execute("DELETE FROM likes WHERE uri = $1", &[&uri])
                    .await?;
            }
            Collection::Repost => {
                self.client
                    .execute("DELETE FROM reposts WHERE uri = $1", &[&uri])
                    .await?;
            }
            Collection::Follow => {
                self.client
                    .execute("DELETE FROM follows WHERE uri = $1", &[&uri])
                    .await?;
            }
            Collection::Profile => {
                self.client
                    .execute("DELETE FROM profiles WHERE uri = $1", &[&uri])
                    .await?;
            }
            Collection::Generator => {
                self.client
                    .execute("DELETE FROM generators WHERE uri = $1", &[&uri])
                    .await?;
            }
            Collection::Subscription => {
                self.client
                    .execute("DELETE FROM subscriptions WHERE uri = $1", &[&uri])
                    .await?;
            }
        }
        Ok(())
    }

    async fn upsert_post(&mut self, rec: &Record, post: &PostView) -> Result<()> {
        let reply_parent = post.reply.as_ref().map(|r| r.parent.uri.clone());
        let reply_root = post.reply.as_ref().map(|r| r.root.uri.clone());
        self.client
            .execute(
                "INSERT INTO posts(uri, did, text, reply_parent, reply_root, created_at, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT(uri) DO UPDATE SET
                   text = excluded.text,
                   reply_parent = excluded.reply_parent,
                   reply_root = excluded.reply_root,
                   created_at = excluded.created_at,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.uri,
                    &rec.did,
                    &post.text,
                    &reply_parent,
                    &reply_root,
                    &post.created_at,
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        match post.quote_uri() {
            Some(subject) => {
                self.client
                    .execute(
                        "INSERT INTO post_embeds(post_uri, kind, subject_uri) VALUES ($1, 'record', $2)
                         ON CONFLICT(post_uri) DO UPDATE SET
                           kind = excluded.kind,
                           subject_uri = excluded.subject_uri",
                        &[&rec.uri, &subject],
                    )
                    .await?;
            }
            None => {
                self.client
                    .execute("DELETE FROM post_embeds WHERE post_uri = $1", &[&rec.uri])
                    .await?;
            }
        }
        Ok(())
    }

    async fn upsert_like(&mut self, rec: &Record, like: &LikeView) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO likes(uri, did, subject_uri, subject_cid, created_at, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT(uri) DO UPDATE SET
                   subject_uri = excluded.subject_uri,
                   subject_cid = excluded.subject_cid,
                   created_at = excluded.created_at,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.uri,
                    &rec.did,
                    &like.subject.uri,
                    &like.subject.cid,
                    &like.created_at,
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_repost(&mut self, rec: &Record, repost: &RepostView) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO reposts(uri, did, subject_uri, subject_cid, created_at, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT(uri) DO UPDATE SET
                   subject_uri = excluded.subject_uri,
                   subject_cid = excluded.subject_cid,
                   created_at = excluded.created_at,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.uri,
                    &rec.did,
                    &repost.subject.uri,
                    &repost.subject.cid,
                    &repost.created_at,
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_follow(&mut self, rec: &Record, follow: &FollowView) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO follows(uri, did, subject_did, created_at, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT(uri) DO UPDATE SET
                   subject_did = excluded.subject_did,
                   created_at = excluded.created_at,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.uri,
                    &rec.did,
                    &follow.subject,
                    &follow.created_at,
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_profile(&mut self, rec: &Record, profile: &ProfileView) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO profiles(uri, did, display_name, description, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT(uri) DO UPDATE SET
                   display_name = excluded.display_name,
                   description = excluded.description,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.uri,
                    &rec.did,
                    &profile.display_name,
                    &profile.description,
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_generator(&mut self, rec: &Record, generator: &GeneratorView) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO generators(uri, did, service_did, display_name, description, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT(uri) DO UPDATE SET
                   service_did = excluded.service_did,
                   display_name = excluded.display_name,
                   description = excluded.description,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.uri,
                    &rec.did,
                    &generator.did,
                    &generator.display_name,
                    &generator.description,
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn upsert_subscription(&mut self, rec: &Record, sub: &SubscriptionView) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO subscriptions(did, uri, instance, invite_code, created_at, indexed_at_ms)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT(did) DO UPDATE SET
                   uri = excluded.uri,
                   instance = excluded.instance,
                   invite_code = excluded.invite_code,
                   created_at = excluded.created_at,
                   indexed_at_ms = excluded.indexed_at_ms",
                &[
                    &rec.did,
                    &rec.uri,
                    &sub.instance,
                    &sub.invite_code,
                    &sub.created_at,
                    &rec.indexed_at_ms,
                ],
            )
            .await?;
        Ok(())
    }

    async fn mark_invite_used(&mut self, code: &str, did: &str) -> Result<()> {
        self.client
            .execute(
                "UPDATE invite_codes SET used_by = $2, used_at_ms = $3 WHERE code = $1",
                &[&code, &did, &now_ms()],
            )
            .await?;
        Ok(())
    }

    async fn recompute_post_stats(&mut self, uri: &str) -> Result<()> {
        let exists = self
            .client
            .query_opt("SELECT 1 FROM posts WHERE uri = $1", &[&uri])
            .await?
            .is_some();
        if !exists {
            self.client
                .execute("DELETE FROM post_stats WHERE uri = $1", &[&uri])
                .await?;
            return Ok(());
        }
        self.client
            .execute(
                "INSERT INTO post_stats(uri, like_count, repost_count, reply_count, quote_count)
                 VALUES (
                   $1,
                   (SELECT COUNT(*) FROM likes WHERE subject_uri = $1),
                   (SELECT COUNT(*) FROM reposts WHERE subject_uri = $1),
                   (SELECT COUNT(*) FROM posts WHERE reply_parent = $1),
                   (SELECT COUNT(*) FROM post_embeds WHERE subject_uri = $1 AND kind = 'record')
                 )
                 ON CONFLICT(uri) DO UPDATE SET
                   like_count = excluded.like_count,
                   repost_count = excluded.repost_count,
                   reply_count = excluded.reply_count,
                   quote_count = excluded.quote_count",
                &[&uri],
            )
            .await?;
        Ok(())
    }

    async fn recompute_actor_stats(&mut self, did: &str) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO actor_stats(did, follows_count, followers_count, posts_count)
                 VALUES (
                   $1,
                   (SELECT COUNT(*) FROM follows WHERE did = $1),
                   (SELECT COUNT(*) FROM follows WHERE subject_did = $1),
                   (SELECT COUNT(*) FROM posts WHERE did = $1)
                 )
                 ON CONFLICT(did) DO UPDATE SET
                   follows_count = excluded.follows_count,
                   followers_count = excluded.followers_count,
                   posts_count = excluded.posts_count",
                &[&did],
            )
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("COMMIT").await.context("commit tx")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("ROLLBACK")
            .await
            .context("rollback tx")?;
        Ok(())
    }
}
