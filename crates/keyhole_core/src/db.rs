/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::config::IndexerConfig;
use anyhow::{Context, Result};
use deadpool_postgres::{ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use std::time::Duration;
use tokio_postgres::NoTls;
use tracing::warn;

#[derive(Clone)]
pub struct Db {
    pool: Pool,
}

impl Db {
    /// Builds the connection pool and applies the schema, retrying while the
    /// database comes up.
    pub async fn connect(cfg: &IndexerConfig) -> Result<Self> {
        let mut pg_cfg = deadpool_postgres::Config::new();
        pg_cfg.url = Some(cfg.db_url.clone());
        pg_cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_cfg = PoolConfig::new(cfg.pg_pool_max_size);
        pool_cfg.queue_mode = cfg.pg_pool_queue_mode;
        pool_cfg.timeouts = Timeouts {
            wait: cfg.pg_pool_wait_ms.map(Duration::from_millis),
            create: cfg.pg_pool_create_timeout_ms.map(Duration::from_millis),
            recycle: cfg.pg_pool_recycle_timeout_ms.map(Duration::from_millis),
        };
        pg_cfg.pool = Some(pool_cfg);
        let pool = pg_cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .context("create postgres pool")?;

        let db = Self { pool };
        let max_retries = cfg.pg_init_retries;
        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=max_retries {
            match db.apply_schema().await {
                Ok(()) => return Ok(db),
                Err(err) => {
                    last_err = Some(err);
                    let backoff_ms = (attempt as u64 * cfg.pg_init_backoff_ms).min(30_000);
                    warn!(
                        "postgres not ready (attempt {attempt}/{max_retries}); retrying in {backoff_ms}ms"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }
            }
        }
        Err(anyhow::anyhow!(
            "db init failed: {:#}",
            last_err.expect("at least one attempt")
        ))
    }

    async fn apply_schema(&self) -> Result<()> {
        let conn = self.conn().await?;
        conn.batch_execute(include_str!("../sql/postgres_schema.sql"))
            .await
            .context("apply schema")?;
        Ok(())
    }

    pub async fn conn(&self) -> Result<deadpool_postgres::Object> {
        self.pool.get().await.context("get postgres connection")
    }

    pub async fn health_check(&self) -> Result<()> {
        let conn = self.conn().await?;
        let row = conn.query_one("SELECT 1", &[]).await?;
        let _: i32 = row.get(0);
        Ok(())
    }
}
