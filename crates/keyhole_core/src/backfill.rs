/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Repo-sync pipeline: when an actor becomes relevant (new subscriber, or
//! newly followed by one), its entire history is fetched from the origin
//! repository and replayed through the commit router with the policy gate
//! bypassed. Follow records replay first so the actor's follow graph — and
//! therefore membership decisions for everyone else's records — is visible
//! before any of its posts or likes land.

use crate::record::{Collection, Record};
use crate::router::RecordIndexer;
use crate::store::{BackfillStatus, Store, StoreTx};
use anyhow::{Context, Result};
use async_trait::async_trait;
use keyhole_protocol::AtUri;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One record from an actor's repository, before collection filtering.
#[derive(Debug, Clone)]
pub struct FetchedRecord {
    pub uri: String,
    pub cid: String,
    pub value: Value,
}

#[async_trait]
pub trait RepoFetcher: Send + Sync {
    /// Fetches the actor's entire historical record set.
    async fn fetch_repo(&self, did: &str) -> Result<Vec<FetchedRecord>>;
}

/// Fetches a repo collection-by-collection over XRPC with cursor pagination.
pub struct HttpRepoFetcher {
    http: reqwest::Client,
    host: String,
    page_limit: u32,
}

#[derive(Debug, Deserialize)]
struct ListRecordsResponse {
    records: Vec<ListRecordsEntry>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListRecordsEntry {
    uri: String,
    cid: String,
    value: Value,
}

impl HttpRepoFetcher {
    pub fn new(http: reqwest::Client, host: String) -> Self {
        Self {
            http,
            host: host.trim_end_matches('/').to_string(),
            page_limit: 100,
        }
    }
}

#[async_trait]
impl RepoFetcher for HttpRepoFetcher {
    async fn fetch_repo(&self, did: &str) -> Result<Vec<FetchedRecord>> {
        let mut out = Vec::new();
        for collection in Collection::ALL {
            let mut cursor: Option<String> = None;
            loop {
                let url = format!("{}/xrpc/com.atproto.repo.listRecords", self.host);
                let mut req = self.http.get(&url).query(&[
                    ("repo", did),
                    ("collection", collection.nsid()),
                    ("limit", &self.page_limit.to_string()),
                ]);
                if let Some(c) = cursor.as_deref() {
                    req = req.query(&[("cursor", c)]);
                }
                let resp = req.send().await.context("listRecords request")?;
                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    anyhow::bail!("listRecords {} for {did} failed: {status} {body}", collection.nsid());
                }
                let page: ListRecordsResponse =
                    resp.json().await.context("listRecords body")?;
                let page_len = page.records.len();
                for entry in page.records {
                    out.push(FetchedRecord {
                        uri: entry.uri,
                        cid: entry.cid,
                        value: entry.value,
                    });
                }
                cursor = page.cursor;
                if cursor.is_none() || page_len == 0 {
                    break;
                }
            }
        }
        Ok(out)
    }
}

pub struct BackfillRunner {
    store: Arc<dyn Store>,
    router: Arc<RecordIndexer>,
    fetcher: Arc<dyn RepoFetcher>,
    batch_size: usize,
}

impl BackfillRunner {
    pub fn new(
        store: Arc<dyn Store>,
        router: Arc<RecordIndexer>,
        fetcher: Arc<dyn RepoFetcher>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            router,
            fetcher,
            batch_size: batch_size.max(1),
        }
    }

    /// Replays the actor's history. The actor must already exist; any error
    /// mid-sync marks it `failed` and is re-thrown so the scheduler can
    /// retry. Completed batches stay committed — replays are idempotent.
    pub async fn run(&self, did: &str) -> Result<()> {
        self.store
            .get_actor(did)
            .await?
            .with_context(|| format!("backfill target actor not found: {did}"))?;

        self.set_status(did, BackfillStatus::InProcess).await?;
        match self.sync_repo(did).await {
            Ok(indexed) => {
                self.set_status(did, BackfillStatus::Synchronized).await?;
                info!("backfill of {did} complete: {indexed} records");
                Ok(())
            }
            Err(e) => {
                if let Err(mark) = self.set_status(did, BackfillStatus::Failed).await {
                    warn!("marking {did} failed after backfill error: {mark:#}");
                }
                Err(e)
            }
        }
    }

    async fn sync_repo(&self, did: &str) -> Result<usize> {
        let fetched = self.fetcher.fetch_repo(did).await?;

        let mut follows: Vec<Record> = Vec::new();
        let mut rest: Vec<Record> = Vec::new();
        for raw in fetched {
            let Some(at) = AtUri::parse(&raw.uri) else {
                warn!("skipping record with malformed uri: {}", raw.uri);
                continue;
            };
            if Collection::from_nsid(&at.collection).is_none() {
                debug!("dropping unsupported collection {} on {did}", at.collection);
                continue;
            }
            let rec = Record::from_parts(&raw.uri, &raw.cid, raw.value)?;
            if rec.collection == Collection::Follow {
                follows.push(rec);
            } else {
                rest.push(rec);
            }
        }
        let total = follows.len() + rest.len();

        // Follow graph first: other actors' policies may depend on this
        // actor being tracked before its posts replay.
        for chunk in follows.chunks(self.batch_size) {
            self.router.upsert_many(chunk, true).await?;
        }
        self.set_status(did, BackfillStatus::Ready).await?;

        for chunk in rest.chunks(self.batch_size) {
            self.router.upsert_many(chunk, true).await?;
        }
        Ok(total)
    }

    async fn set_status(&self, did: &str, status: BackfillStatus) -> Result<()> {
        let mut tx = self.store.begin().await?;
        tx.set_backfill_status(did, status).await?;
        tx.commit().await
    }
}
