//! Postgres-backed stream queue.
//!
//! Durable implementation of `StreamQueue` over three tables (see
//! `schema.sql`): `stream_messages` is the append-only log, `stream_groups`
//! holds one delivery cursor per consumer group, `stream_pending` is the
//! per-group pending list. Consumption locks the group row so concurrent
//! consumers of the same group never double-deliver; blocking reads poll.

use crate::stream::{GroupStart, PendingEntry, StreamMessage, StreamQueue};
use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod, Runtime};
use foreman_core::QueueError;
use serde_json::Value as JsonValue;
use std::time::{Duration, Instant};
use tokio_postgres::NoTls;

/// How often a blocking consume re-checks the log.
const CONSUME_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Connection configuration for the queue pool.
#[derive(Debug, Clone)]
pub struct PgQueueConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub max_size: usize,
}

impl Default for PgQueueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "foreman".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 8,
        }
    }
}

impl PgQueueConfig {
    /// Read configuration from `FOREMAN_DB_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("FOREMAN_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("FOREMAN_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("FOREMAN_DB_NAME").unwrap_or_else(|_| "foreman".to_string()),
            user: std::env::var("FOREMAN_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("FOREMAN_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("FOREMAN_QUEUE_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8),
        }
    }

    pub fn create_pool(&self) -> Result<Pool, QueueError> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| QueueError::Unavailable {
                reason: format!("failed to create queue pool: {}", e),
            })
    }
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

/// Durable stream queue over a Postgres connection pool.
#[derive(Clone)]
pub struct PgStreamQueue {
    pool: Pool,
}

impl PgStreamQueue {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &PgQueueConfig) -> Result<Self, QueueError> {
        Ok(Self::new(config.create_pool()?))
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, QueueError> {
        self.pool.get().await.map_err(|e| QueueError::Unavailable {
            reason: format!("queue pool: {}", e),
        })
    }

    /// One non-blocking delivery attempt for a group.
    async fn consume_once(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(unavailable)?;

        let cursor_row = tx
            .query_opt(
                "SELECT cursor_seq FROM stream_groups \
                 WHERE stream = $1 AND group_name = $2 FOR UPDATE",
                &[&stream, &group],
            )
            .await
            .map_err(unavailable)?;
        let cursor: i64 = match cursor_row {
            Some(row) => row.get(0),
            None => {
                return Err(QueueError::NoSuchGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                })
            }
        };

        let rows = tx
            .query(
                "SELECT seq, id, payload FROM stream_messages \
                 WHERE stream = $1 AND seq > $2 ORDER BY seq LIMIT $3",
                &[&stream, &cursor, &(max as i64)],
            )
            .await
            .map_err(unavailable)?;

        if rows.is_empty() {
            tx.commit().await.map_err(unavailable)?;
            return Ok(Vec::new());
        }

        let mut batch = Vec::with_capacity(rows.len());
        let mut last_seq = cursor;
        for row in &rows {
            let seq: i64 = row.get(0);
            let id: String = row.get(1);
            let payload: JsonValue = row.get(2);
            tx.execute(
                "INSERT INTO stream_pending \
                 (stream, group_name, id, seq, payload, consumer, delivered_at, delivery_count) \
                 VALUES ($1, $2, $3, $4, $5, $6, now(), 1)",
                &[&stream, &group, &id, &seq, &payload, &consumer],
            )
            .await
            .map_err(unavailable)?;
            last_seq = seq;
            batch.push(StreamMessage { id, payload });
        }

        tx.execute(
            "UPDATE stream_groups SET cursor_seq = $3 \
             WHERE stream = $1 AND group_name = $2",
            &[&stream, &group, &last_seq],
        )
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(batch)
    }
}

fn unavailable(e: tokio_postgres::Error) -> QueueError {
    QueueError::Unavailable {
        reason: e.to_string(),
    }
}

#[async_trait]
impl StreamQueue for PgStreamQueue {
    async fn publish(&self, stream: &str, payload: &JsonValue) -> Result<String, QueueError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "WITH next AS (SELECT nextval('stream_message_seq') AS seq) \
                 INSERT INTO stream_messages (stream, seq, id, payload) \
                 SELECT $1, next.seq, \
                        lpad((extract(epoch FROM now()) * 1000)::bigint::text, 13, '0') \
                        || '-' || lpad((next.seq % 1000000)::text, 6, '0'), \
                        $2 \
                 FROM next \
                 RETURNING id",
                &[&stream, payload],
            )
            .await
            .map_err(unavailable)?;
        Ok(row.get(0))
    }

    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), QueueError> {
        let conn = self.conn().await?;
        let start_at_end = matches!(start, GroupStart::New);
        conn.execute(
            "INSERT INTO stream_groups (stream, group_name, cursor_seq) \
             SELECT $1, $2, CASE WHEN $3 \
                 THEN COALESCE((SELECT max(seq) FROM stream_messages WHERE stream = $1), 0) \
                 ELSE 0 END \
             ON CONFLICT (stream, group_name) DO NOTHING",
            &[&stream, &group, &start_at_end],
        )
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let deadline = Instant::now() + Duration::from_millis(block_ms);
        loop {
            let batch = self.consume_once(stream, group, consumer, max).await?;
            if !batch.is_empty() || Instant::now() >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep(CONSUME_POLL_INTERVAL.min(deadline - Instant::now())).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, QueueError> {
        let conn = self.conn().await?;
        let removed = conn
            .execute(
                "DELETE FROM stream_pending \
                 WHERE stream = $1 AND group_name = $2 AND id = $3",
                &[&stream, &group, &id],
            )
            .await
            .map_err(unavailable)?;
        Ok(removed > 0)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, QueueError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, consumer, \
                        (extract(epoch FROM (now() - delivered_at)) * 1000)::bigint, \
                        delivery_count \
                 FROM stream_pending \
                 WHERE stream = $1 AND group_name = $2 ORDER BY seq",
                &[&stream, &group],
            )
            .await
            .map_err(unavailable)?;
        Ok(rows
            .iter()
            .map(|row| {
                let idle: i64 = row.get(2);
                let delivery_count: i32 = row.get(3);
                PendingEntry {
                    id: row.get(0),
                    consumer: row.get(1),
                    idle_ms: idle.max(0) as u64,
                    delivery_count: delivery_count.max(0) as u32,
                }
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, QueueError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "UPDATE stream_pending \
                 SET consumer = $3, delivered_at = now(), delivery_count = delivery_count + 1 \
                 WHERE stream = $1 AND group_name = $2 AND id = ANY($4) \
                   AND (extract(epoch FROM (now() - delivered_at)) * 1000)::float8 >= $5 \
                 RETURNING id, payload",
                &[
                    &stream,
                    &group,
                    &new_consumer,
                    &ids,
                    &(min_idle_ms as f64),
                ],
            )
            .await
            .map_err(unavailable)?;
        Ok(rows
            .iter()
            .map(|row| StreamMessage {
                id: row.get(0),
                payload: row.get(1),
            })
            .collect())
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, QueueError> {
        let conn = self.conn().await?;
        let removed = conn
            .execute(
                "DELETE FROM stream_messages \
                 WHERE stream = $1 AND seq < COALESCE((\
                     SELECT min(seq) FROM (\
                         SELECT seq FROM stream_messages \
                         WHERE stream = $1 ORDER BY seq DESC LIMIT $2\
                     ) newest\
                 ), 0)",
                &[&stream, &(max_len as i64)],
            )
            .await
            .map_err(unavailable)?;
        Ok(removed)
    }
}
