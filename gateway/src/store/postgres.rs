//! Postgres-backed `Store`, satisfying the "transactional relational
//! store" assumption in spec.md §3. `sqlx` is drawn from the pack's
//! `mikefaille-adk-rust` crates (`adk-memory`, `adk-session`), which use
//! it for the same durable-relational-state role; the teacher crate
//! fronts a database rather than owning one, so this piece has no direct
//! teacher counterpart.
//!
//! Schema (see `migrations/0001_init.sql`): one table per record in
//! spec.md §3, with `request_hashes.merkle_batch_id` nullable and a
//! partial index on the unbatched rows to keep §4.5 step 1 cheap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::ids::{ApiKeyId, MerkleRootId, ServiceId};
use crate::model::{ApiKey, BotDetectionLog, MerkleRoot, RequestHash, Service};

use super::{NewBatch, Store, StoreError};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn backend_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl Store for PgStore {
    async fn resolve_key(&self, secret: &str) -> Result<Option<(ApiKey, Service)>, StoreError> {
        let row = sqlx::query(
            r#"
            select k.id as key_id, k.secret, k.service_id, k.is_active, k.created_at,
                   k.rate_limit_requests, k.rate_limit_window_seconds,
                   k.price_per_request, k.total_cost,
                   s.id as service_id_s, s.name, s.target_url, s.owner_id,
                   s.watermarking_enabled, s.bot_blocking_enabled, s.bot_threshold
            from api_keys k
            join services s on s.id = k.service_id
            where k.secret = $1 and k.is_active = true
            "#,
        )
        .bind(secret)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;

        let Some(row) = row else { return Ok(None) };

        let key = ApiKey {
            id: ApiKeyId(row.try_get("key_id").map_err(backend_err)?),
            secret: row.try_get("secret").map_err(backend_err)?,
            service_id: ServiceId(row.try_get("service_id").map_err(backend_err)?),
            is_active: row.try_get("is_active").map_err(backend_err)?,
            created_at: row.try_get("created_at").map_err(backend_err)?,
            rate_limit_requests: row
                .try_get::<Option<i32>, _>("rate_limit_requests")
                .map_err(backend_err)?
                .map(|v| v as u32),
            rate_limit_window_seconds: row
                .try_get::<Option<i32>, _>("rate_limit_window_seconds")
                .map_err(backend_err)?
                .map(|v| v as u32),
            price_per_request: row.try_get("price_per_request").map_err(backend_err)?,
            total_cost: row.try_get("total_cost").map_err(backend_err)?,
        };
        let service = Service {
            id: ServiceId(row.try_get("service_id_s").map_err(backend_err)?),
            name: row.try_get("name").map_err(backend_err)?,
            target_url: row.try_get("target_url").map_err(backend_err)?,
            owner_id: row.try_get("owner_id").map_err(backend_err)?,
            watermarking_enabled: row.try_get("watermarking_enabled").map_err(backend_err)?,
            bot_blocking_enabled: row.try_get("bot_blocking_enabled").map_err(backend_err)?,
            bot_threshold: row.try_get("bot_threshold").map_err(backend_err)?,
        };
        Ok(Some((key, service)))
    }

    async fn get_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        let row = sqlx::query(
            "select id, name, target_url, owner_id, watermarking_enabled, bot_blocking_enabled, bot_threshold
             from services where id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(Service {
            id: ServiceId(row.try_get("id").map_err(backend_err)?),
            name: row.try_get("name").map_err(backend_err)?,
            target_url: row.try_get("target_url").map_err(backend_err)?,
            owner_id: row.try_get("owner_id").map_err(backend_err)?,
            watermarking_enabled: row.try_get("watermarking_enabled").map_err(backend_err)?,
            bot_blocking_enabled: row.try_get("bot_blocking_enabled").map_err(backend_err)?,
            bot_threshold: row.try_get("bot_threshold").map_err(backend_err)?,
        }))
    }

    async fn create_service(&self, service: Service) -> Result<Service, StoreError> {
        let row = sqlx::query(
            r#"
            insert into services (name, target_url, owner_id, watermarking_enabled, bot_blocking_enabled, bot_threshold)
            values ($1, $2, $3, $4, $5, $6)
            returning id
            "#,
        )
        .bind(&service.name)
        .bind(&service.target_url)
        .bind(service.owner_id)
        .bind(service.watermarking_enabled)
        .bind(service.bot_blocking_enabled)
        .bind(service.bot_threshold)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(Service {
            id: ServiceId(row.try_get("id").map_err(backend_err)?),
            ..service
        })
    }

    async fn create_api_key(&self, key: ApiKey) -> Result<ApiKey, StoreError> {
        let row = sqlx::query(
            r#"
            insert into api_keys (secret, service_id, is_active, created_at, rate_limit_requests,
                                   rate_limit_window_seconds, price_per_request, total_cost)
            values ($1, $2, $3, $4, $5, $6, $7, $8)
            returning id
            "#,
        )
        .bind(&key.secret)
        .bind(key.service_id.0)
        .bind(key.is_active)
        .bind(key.created_at)
        .bind(key.rate_limit_requests.map(|v| v as i32))
        .bind(key.rate_limit_window_seconds.map(|v| v as i32))
        .bind(key.price_per_request)
        .bind(key.total_cost)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(ApiKey {
            id: ApiKeyId(row.try_get("id").map_err(backend_err)?),
            ..key
        })
    }

    async fn get_api_key(&self, id: ApiKeyId) -> Result<Option<ApiKey>, StoreError> {
        let row = sqlx::query(
            "select id, secret, service_id, is_active, created_at, rate_limit_requests,
                    rate_limit_window_seconds, price_per_request, total_cost
             from api_keys where id = $1",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        let Some(row) = row else { return Ok(None) };
        Ok(Some(ApiKey {
            id: ApiKeyId(row.try_get("id").map_err(backend_err)?),
            secret: row.try_get("secret").map_err(backend_err)?,
            service_id: ServiceId(row.try_get("service_id").map_err(backend_err)?),
            is_active: row.try_get("is_active").map_err(backend_err)?,
            created_at: row.try_get("created_at").map_err(backend_err)?,
            rate_limit_requests: row
                .try_get::<Option<i32>, _>("rate_limit_requests")
                .map_err(backend_err)?
                .map(|v| v as u32),
            rate_limit_window_seconds: row
                .try_get::<Option<i32>, _>("rate_limit_window_seconds")
                .map_err(backend_err)?
                .map(|v| v as u32),
            price_per_request: row.try_get("price_per_request").map_err(backend_err)?,
            total_cost: row.try_get("total_cost").map_err(backend_err)?,
        }))
    }

    async fn revoke_api_key(&self, id: ApiKeyId) -> Result<(), StoreError> {
        let result = sqlx::query("update api_keys set is_active = false where id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_rate_limit(
        &self,
        id: ApiKeyId,
        requests: u32,
        window_seconds: u32,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "update api_keys set rate_limit_requests = $1, rate_limit_window_seconds = $2 where id = $3",
        )
        .bind(requests as i32)
        .bind(window_seconds as i32)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_watermarking(&self, service_id: ServiceId, enabled: bool) -> Result<(), StoreError> {
        let result = sqlx::query("update services set watermarking_enabled = $1 where id = $2")
            .bind(enabled)
            .bind(service_id.0)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn set_bot_blocking(&self, service_id: ServiceId, enabled: bool) -> Result<(), StoreError> {
        let result = sqlx::query("update services set bot_blocking_enabled = $1 where id = $2")
            .bind(enabled)
            .bind(service_id.0)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn record_usage_and_bill(
        &self,
        service_id: ServiceId,
        api_key_id: ApiKeyId,
        api_key_secret: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        sqlx::query(
            "insert into usage_logs (service_id, api_key_secret, timestamp) values ($1, $2, $3)",
        )
        .bind(service_id.0)
        .bind(api_key_secret)
        .bind(timestamp)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        sqlx::query(
            "update api_keys set total_cost = total_cost + price_per_request where id = $1",
        )
        .bind(api_key_id.0)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;
        tx.commit().await.map_err(backend_err)?;
        Ok(())
    }

    async fn count_usage_since(
        &self,
        api_key_secret: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let row = sqlx::query(
            "select count(*) as n from usage_logs where api_key_secret = $1 and timestamp >= $2",
        )
        .bind(api_key_secret)
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;
        let n: i64 = row.try_get("n").map_err(backend_err)?;
        Ok(n as u64)
    }

    async fn commit_request_hash(&self, row: RequestHash) -> Result<i64, StoreError> {
        let rec = sqlx::query(
            r#"
            insert into request_hashes (service_id, api_key_id, timestamp, request_path, response_status, hash, merkle_batch_id)
            values ($1, $2, $3, $4, $5, $6, null)
            returning id
            "#,
        )
        .bind(row.service_id.0)
        .bind(row.api_key_id.0)
        .bind(row.timestamp)
        .bind(&row.request_path)
        .bind(row.response_status as i32)
        .bind(hex::encode(row.hash))
        .fetch_one(&self.pool)
        .await
        .map_err(backend_err)?;
        rec.try_get::<i64, _>("id").map_err(backend_err)
    }

    async fn oldest_unbatched_hashes(
        &self,
        batch_size: usize,
    ) -> Result<Vec<RequestHash>, StoreError> {
        let rows = sqlx::query(
            r#"
            select id, service_id, api_key_id, timestamp, request_path, response_status, hash, merkle_batch_id
            from request_hashes
            where merkle_batch_id is null
            order by timestamp asc, id asc
            limit $1
            "#,
        )
        .bind(batch_size as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;

        rows.into_iter().map(row_to_hash).collect()
    }

    async fn close_batch(&self, batch: NewBatch) -> Result<MerkleRootId, StoreError> {
        // A serializable transaction provides the row-lock guarantee
        // spec.md §4.5 step 1 requires: the `where merkle_batch_id is
        // null` update below only succeeds for rows nobody else has
        // claimed since they were selected.
        let mut tx = self.pool.begin().await.map_err(backend_err)?;
        sqlx::query("set transaction isolation level serializable")
            .execute(&mut *tx)
            .await
            .map_err(backend_err)?;

        let row = sqlx::query(
            r#"
            insert into merkle_roots (merkle_root, start_time, end_time, request_count, is_anchored)
            values ($1, $2, $3, $4, false)
            returning id
            "#,
        )
        .bind(hex::encode(batch.root))
        .bind(batch.start_time)
        .bind(batch.end_time)
        .bind(batch.request_ids.len() as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(backend_err)?;
        let batch_id: i64 = row.try_get("id").map_err(backend_err)?;

        let result = sqlx::query(
            "update request_hashes set merkle_batch_id = $1 where id = any($2) and merkle_batch_id is null",
        )
        .bind(batch_id)
        .bind(&batch.request_ids)
        .execute(&mut *tx)
        .await
        .map_err(backend_err)?;

        if result.rows_affected() as usize != batch.request_ids.len() {
            tx.rollback().await.map_err(backend_err)?;
            return Err(StoreError::Backend(
                "batch overlapped a concurrently closed batch".into(),
            ));
        }

        tx.commit().await.map_err(backend_err)?;
        Ok(MerkleRootId(batch_id))
    }

    async fn get_merkle_root(&self, id: MerkleRootId) -> Result<Option<MerkleRoot>, StoreError> {
        let row = sqlx::query(
            r#"
            select id, merkle_root, start_time, end_time, request_count, created_at,
                   is_anchored, tx_hash, block_number, anchored_at
            from merkle_roots where id = $1
            "#,
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(row_to_root).transpose()
    }

    async fn latest_merkle_root(&self) -> Result<Option<MerkleRoot>, StoreError> {
        let row = sqlx::query(
            r#"
            select id, merkle_root, start_time, end_time, request_count, created_at,
                   is_anchored, tx_hash, block_number, anchored_at
            from merkle_roots order by id desc limit 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.map(row_to_root).transpose()
    }

    async fn merkle_history(&self, limit: usize, offset: usize) -> Result<Vec<MerkleRoot>, StoreError> {
        let rows = sqlx::query(
            r#"
            select id, merkle_root, start_time, end_time, request_count, created_at,
                   is_anchored, tx_hash, block_number, anchored_at
            from merkle_roots order by id desc limit $1 offset $2
            "#,
        )
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.into_iter().map(row_to_root).collect()
    }

    async fn hashes_in_batch(&self, batch_id: MerkleRootId) -> Result<Vec<RequestHash>, StoreError> {
        let rows = sqlx::query(
            r#"
            select id, service_id, api_key_id, timestamp, request_path, response_status, hash, merkle_batch_id
            from request_hashes where merkle_batch_id = $1 order by id asc
            "#,
        )
        .bind(batch_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.into_iter().map(row_to_hash).collect()
    }

    async fn mark_batch_anchored(
        &self,
        id: MerkleRootId,
        tx_hash: String,
        block_number: u64,
        anchored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "update merkle_roots set is_anchored = true, tx_hash = $1, block_number = $2, anchored_at = $3 where id = $4",
        )
        .bind(tx_hash)
        .bind(block_number as i64)
        .bind(anchored_at)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn record_bot_detection(&self, row: BotDetectionLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            insert into bot_detection_logs (service_id, api_key_secret, bot_score, classification, user_agent, action, timestamp)
            values ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(row.service_id.0)
        .bind(&row.api_key_secret)
        .bind(row.bot_score)
        .bind(row.classification.to_string())
        .bind(&row.user_agent)
        .bind(row.action.to_string())
        .bind(row.timestamp)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }
}

fn row_to_hash(row: sqlx::postgres::PgRow) -> Result<RequestHash, StoreError> {
    let hash_hex: String = row.try_get("hash").map_err(backend_err)?;
    let mut hash = [0u8; 32];
    hex::decode_to_slice(&hash_hex, &mut hash)
        .map_err(|e| StoreError::Backend(format!("corrupt hash column: {e}")))?;
    Ok(RequestHash {
        id: row.try_get("id").map_err(backend_err)?,
        service_id: ServiceId(row.try_get("service_id").map_err(backend_err)?),
        api_key_id: ApiKeyId(row.try_get("api_key_id").map_err(backend_err)?),
        timestamp: row.try_get("timestamp").map_err(backend_err)?,
        request_path: row.try_get("request_path").map_err(backend_err)?,
        response_status: row.try_get::<i32, _>("response_status").map_err(backend_err)? as u16,
        hash,
        merkle_batch_id: row
            .try_get::<Option<i64>, _>("merkle_batch_id")
            .map_err(backend_err)?
            .map(MerkleRootId),
    })
}

fn row_to_root(row: sqlx::postgres::PgRow) -> Result<MerkleRoot, StoreError> {
    let root_hex: String = row.try_get("merkle_root").map_err(backend_err)?;
    let mut root = [0u8; 32];
    hex::decode_to_slice(&root_hex, &mut root)
        .map_err(|e| StoreError::Backend(format!("corrupt root column: {e}")))?;
    Ok(MerkleRoot {
        id: MerkleRootId(row.try_get("id").map_err(backend_err)?),
        root,
        start_time: row.try_get("start_time").map_err(backend_err)?,
        end_time: row.try_get("end_time").map_err(backend_err)?,
        request_count: row.try_get::<i32, _>("request_count").map_err(backend_err)? as u32,
        created_at: row.try_get("created_at").map_err(backend_err)?,
        is_anchored: row.try_get("is_anchored").map_err(backend_err)?,
        tx_hash: row.try_get("tx_hash").map_err(backend_err)?,
        block_number: row
            .try_get::<Option<i64>, _>("block_number")
            .map_err(backend_err)?
            .map(|v| v as u64),
        anchored_at: row.try_get("anchored_at").map_err(backend_err)?,
    })
}
