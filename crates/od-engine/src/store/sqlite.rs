//! SQLite CampaignStore
//!
//! Timestamps are stored as epoch milliseconds. Status changes are single
//! conditional UPDATE statements, so compare-and-set holds across processes
//! sharing the database file.

use super::{CampaignStore, CounterDelta, Placement, RecipientTransition, StaleQuery, StoreResult};
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use od_common::{
    CallStatus, Campaign, CampaignQueueEntry, CampaignStatus, ContactDetails, OptimizedBatchConfig,
    QueueStatus, Recipient, VoiceAgent,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{debug, info};

const RECIPIENT_COLUMNS: &str = "seq, id, campaign_id, phone_number, contact, call_status, attempts, \
     last_attempt_at, external_call_id, scheduled_for, last_error, created_at, updated_at";

const QUEUE_COLUMNS: &str = "campaign_id, workspace_id, total_recipients, chunk_size, total_chunks, \
     chunks_processed, processed_count, status, batch_config, last_error, processing_started_at, \
     created_at, updated_at";

pub struct SqliteCampaignStore {
    pool: SqlitePool,
}

impl SqliteCampaignStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Get the pool reference
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init_schema(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                status TEXT NOT NULL,
                pending_recipients INTEGER NOT NULL DEFAULT 0,
                successful_recipients INTEGER NOT NULL DEFAULT 0,
                failed_recipients INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS voice_agents (
                id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recipients (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                campaign_id TEXT NOT NULL,
                phone_number TEXT NOT NULL,
                contact TEXT NOT NULL,
                call_status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt_at INTEGER,
                external_call_id TEXT,
                scheduled_for INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recipients_campaign_status ON recipients(campaign_id, call_status, created_at);
            CREATE INDEX IF NOT EXISTS idx_recipients_status_updated ON recipients(call_status, updated_at);
            CREATE TABLE IF NOT EXISTS campaign_queues (
                campaign_id TEXT PRIMARY KEY,
                workspace_id TEXT NOT NULL,
                total_recipients INTEGER NOT NULL,
                chunk_size INTEGER NOT NULL,
                total_chunks INTEGER NOT NULL,
                chunks_processed INTEGER NOT NULL DEFAULT 0,
                processed_count INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                batch_config TEXT NOT NULL,
                last_error TEXT,
                processing_started_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_campaign_queues_status ON campaign_queues(status);
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Initialized SQLite campaign store schema");
        Ok(())
    }

    fn parse_recipient(row: &SqliteRow) -> StoreResult<Recipient> {
        let contact: ContactDetails = serde_json::from_str(row.try_get("contact")?)?;
        let last_attempt_at: Option<i64> = row.try_get("last_attempt_at")?;
        let scheduled_for: Option<i64> = row.try_get("scheduled_for")?;

        Ok(Recipient {
            id: row.try_get("id")?,
            campaign_id: row.try_get("campaign_id")?,
            phone_number: row.try_get("phone_number")?,
            contact,
            call_status: parse_enum(row.try_get("call_status")?)?,
            attempts: u32::try_from(row.try_get::<i64, _>("attempts")?).unwrap_or(u32::MAX),
            last_attempt_at: last_attempt_at.map(from_millis).transpose()?,
            external_call_id: row.try_get("external_call_id")?,
            scheduled_for: scheduled_for.map(from_millis).transpose()?,
            last_error: row.try_get("last_error")?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    fn parse_queue_entry(row: &SqliteRow) -> StoreResult<CampaignQueueEntry> {
        let batch_config: OptimizedBatchConfig = serde_json::from_str(row.try_get("batch_config")?)?;
        let processing_started_at: Option<i64> = row.try_get("processing_started_at")?;

        Ok(CampaignQueueEntry {
            campaign_id: row.try_get("campaign_id")?,
            workspace_id: row.try_get("workspace_id")?,
            total_recipients: to_u64(row.try_get("total_recipients")?),
            chunk_size: u32::try_from(row.try_get::<i64, _>("chunk_size")?).unwrap_or(1),
            total_chunks: to_u64(row.try_get("total_chunks")?),
            chunks_processed: to_u64(row.try_get("chunks_processed")?),
            processed_count: to_u64(row.try_get("processed_count")?),
            status: parse_enum(row.try_get("status")?)?,
            batch_config,
            last_error: row.try_get("last_error")?,
            processing_started_at: processing_started_at.map(from_millis).transpose()?,
            created_at: from_millis(row.try_get("created_at")?)?,
            updated_at: from_millis(row.try_get("updated_at")?)?,
        })
    }

    async fn recipient_exists(&self, recipient_id: &str) -> StoreResult<bool> {
        let row = sqlx::query("SELECT 1 FROM recipients WHERE id = ?")
            .bind(recipient_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

fn from_millis(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp {ms}")))
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_enum<T: FromStr<Err = String>>(value: String) -> StoreResult<T> {
    value.parse().map_err(StoreError::Corrupt)
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn not_found(entity: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[async_trait]
impl CampaignStore for SqliteCampaignStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO campaigns \
             (id, workspace_id, agent_id, status, pending_recipients, successful_recipients, failed_recipients, body, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&campaign.id)
        .bind(&campaign.workspace_id)
        .bind(&campaign.agent_id)
        .bind(campaign.status.as_str())
        .bind(to_i64(campaign.pending_recipients))
        .bind(to_i64(campaign.successful_recipients))
        .bind(to_i64(campaign.failed_recipients))
        .bind(serde_json::to_string(campaign)?)
        .bind(campaign.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_campaign(&self, campaign_id: &str) -> StoreResult<Option<Campaign>> {
        let row = sqlx::query(
            "SELECT status, pending_recipients, successful_recipients, failed_recipients, body, updated_at \
             FROM campaigns WHERE id = ?",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        // Mutable columns win over the stored document
        let mut campaign: Campaign = serde_json::from_str(row.try_get("body")?)?;
        campaign.status = parse_enum(row.try_get("status")?)?;
        campaign.pending_recipients = to_u64(row.try_get("pending_recipients")?);
        campaign.successful_recipients = to_u64(row.try_get("successful_recipients")?);
        campaign.failed_recipients = to_u64(row.try_get("failed_recipients")?);
        campaign.updated_at = from_millis(row.try_get("updated_at")?)?;
        Ok(Some(campaign))
    }

    async fn set_campaign_status(&self, campaign_id: &str, status: CampaignStatus) -> StoreResult<()> {
        let result = sqlx::query("UPDATE campaigns SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp_millis())
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(not_found("campaign", campaign_id));
        }
        Ok(())
    }

    async fn apply_campaign_counters(&self, campaign_id: &str, delta: CounterDelta) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE campaigns SET \
             pending_recipients = MAX(pending_recipients + ?, 0), \
             successful_recipients = MAX(successful_recipients + ?, 0), \
             failed_recipients = MAX(failed_recipients + ?, 0), \
             updated_at = ? \
             WHERE id = ?",
        )
        .bind(delta.pending)
        .bind(delta.successful)
        .bind(delta.failed)
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found("campaign", campaign_id));
        }
        Ok(())
    }

    async fn insert_agent(&self, agent: &VoiceAgent) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO voice_agents (id, workspace_id, body) VALUES (?, ?, ?)")
            .bind(&agent.id)
            .bind(&agent.workspace_id)
            .bind(serde_json::to_string(agent)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_agent(&self, agent_id: &str) -> StoreResult<Option<VoiceAgent>> {
        let row = sqlx::query("SELECT body FROM voice_agents WHERE id = ?")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(serde_json::from_str(row.try_get("body")?)?)),
            None => Ok(None),
        }
    }

    async fn insert_recipients(&self, recipients: &[Recipient]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for recipient in recipients {
            let result = sqlx::query(
                "INSERT INTO recipients \
                 (id, campaign_id, phone_number, contact, call_status, attempts, last_attempt_at, \
                  external_call_id, scheduled_for, last_error, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&recipient.id)
            .bind(&recipient.campaign_id)
            .bind(&recipient.phone_number)
            .bind(serde_json::to_string(&recipient.contact)?)
            .bind(recipient.call_status.as_str())
            .bind(i64::from(recipient.attempts))
            .bind(recipient.last_attempt_at.map(|t| t.timestamp_millis()))
            .bind(&recipient.external_call_id)
            .bind(recipient.scheduled_for.map(|t| t.timestamp_millis()))
            .bind(&recipient.last_error)
            .bind(recipient.created_at.timestamp_millis())
            .bind(recipient.updated_at.timestamp_millis())
            .execute(&mut *tx)
            .await;

            if let Err(e) = result {
                if is_unique_violation(&e) {
                    return Err(StoreError::Conflict(format!("recipient {} already exists", recipient.id)));
                }
                return Err(e.into());
            }
        }
        tx.commit().await?;

        debug!(count = recipients.len(), "Inserted recipients");
        Ok(())
    }

    async fn get_recipient(&self, recipient_id: &str) -> StoreResult<Option<Recipient>> {
        let query = format!("SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(recipient_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_recipient).transpose()
    }

    async fn count_recipients(&self, campaign_id: &str, status: CallStatus) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM recipients WHERE campaign_id = ? AND call_status = ?",
        )
        .bind(campaign_id)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }

    async fn count_retryable_failures(&self, campaign_id: &str, max_attempts: u32) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM recipients \
             WHERE campaign_id = ? AND call_status = 'failed' AND external_call_id IS NULL AND attempts < ?",
        )
        .bind(campaign_id)
        .bind(i64::from(max_attempts))
        .fetch_one(&self.pool)
        .await?;
        Ok(to_u64(count))
    }

    async fn claim_pending_recipients(&self, campaign_id: &str, limit: u32) -> StoreResult<Vec<Recipient>> {
        let query = format!(
            "UPDATE recipients SET call_status = 'queued', updated_at = ? \
             WHERE seq IN (\
                SELECT seq FROM recipients \
                WHERE campaign_id = ? AND call_status = 'pending' \
                ORDER BY created_at ASC, seq ASC LIMIT ?\
             ) \
             RETURNING {RECIPIENT_COLUMNS}"
        );

        let rows = sqlx::query(&query)
            .bind(Utc::now().timestamp_millis())
            .bind(campaign_id)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        // RETURNING order is unspecified
        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let seq: i64 = row.try_get("seq")?;
            claimed.push((seq, Self::parse_recipient(row)?));
        }
        claimed.sort_by(|(seq_a, a), (seq_b, b)| a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b)));

        debug!(campaign_id = %campaign_id, count = claimed.len(), "Claimed pending recipients");
        Ok(claimed.into_iter().map(|(_, r)| r).collect())
    }

    async fn transition_recipient(
        &self,
        recipient_id: &str,
        expected: CallStatus,
        transition: &RecipientTransition,
    ) -> StoreResult<bool> {
        let at = transition.at.timestamp_millis();
        let result = sqlx::query(
            "UPDATE recipients SET \
             call_status = ?, \
             attempts = attempts + ?, \
             last_attempt_at = CASE WHEN ? THEN ? ELSE last_attempt_at END, \
             scheduled_for = CASE WHEN ? THEN ? ELSE scheduled_for END, \
             external_call_id = COALESCE(?, external_call_id), \
             last_error = COALESCE(?, CASE WHEN ? THEN NULL ELSE last_error END), \
             updated_at = ? \
             WHERE id = ? AND call_status = ?",
        )
        .bind(transition.to.as_str())
        .bind(i64::from(transition.attempt))
        .bind(transition.attempt)
        .bind(at)
        .bind(transition.attempt)
        .bind(transition.scheduled_for.map(|t| t.timestamp_millis()))
        .bind(&transition.external_call_id)
        .bind(&transition.last_error)
        .bind(transition.clear_error)
        .bind(at)
        .bind(recipient_id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.recipient_exists(recipient_id).await? {
            return Err(not_found("recipient", recipient_id));
        }
        Ok(false)
    }

    async fn find_stale_recipients(&self, query: &StaleQuery) -> StoreResult<Vec<Recipient>> {
        let sql = format!(
            "SELECT {RECIPIENT_COLUMNS} FROM recipients \
             WHERE call_status = ? AND MAX(updated_at, COALESCE(scheduled_for, 0)) < ? \
             AND (? IS NULL OR attempts < ?) \
             AND (? = 'any' OR (? = 'placed') = (external_call_id IS NOT NULL)) \
             ORDER BY MAX(updated_at, COALESCE(scheduled_for, 0)) ASC LIMIT ?"
        );
        let attempts_below = query.attempts_below.map(i64::from);
        let placement = match query.placement {
            Placement::Any => "any",
            Placement::Placed => "placed",
            Placement::Unplaced => "unplaced",
        };

        let rows = sqlx::query(&sql)
            .bind(query.status.as_str())
            .bind(query.stale_before.timestamp_millis())
            .bind(attempts_below)
            .bind(attempts_below)
            .bind(placement)
            .bind(placement)
            .bind(i64::from(query.limit))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_recipient).collect()
    }

    async fn insert_queue_entry(&self, entry: &CampaignQueueEntry) -> StoreResult<()> {
        let result = sqlx::query(
            "INSERT INTO campaign_queues \
             (campaign_id, workspace_id, total_recipients, chunk_size, total_chunks, chunks_processed, \
              processed_count, status, batch_config, last_error, processing_started_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.campaign_id)
        .bind(&entry.workspace_id)
        .bind(to_i64(entry.total_recipients))
        .bind(i64::from(entry.chunk_size))
        .bind(to_i64(entry.total_chunks))
        .bind(to_i64(entry.chunks_processed))
        .bind(to_i64(entry.processed_count))
        .bind(entry.status.as_str())
        .bind(serde_json::to_string(&entry.batch_config)?)
        .bind(&entry.last_error)
        .bind(entry.processing_started_at.map(|t| t.timestamp_millis()))
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::Conflict(format!(
                "queue for campaign {} already exists",
                entry.campaign_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_queue_entry(&self, campaign_id: &str) -> StoreResult<Option<CampaignQueueEntry>> {
        let query = format!("SELECT {QUEUE_COLUMNS} FROM campaign_queues WHERE campaign_id = ?");
        let row = sqlx::query(&query)
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_queue_entry).transpose()
    }

    async fn try_begin_processing(
        &self,
        campaign_id: &str,
        now: DateTime<Utc>,
        lease_expired_before: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE campaign_queues SET status = 'processing', processing_started_at = ?, updated_at = ? \
             WHERE campaign_id = ? AND (\
                status = 'pending' \
                OR (status = 'processing' AND (processing_started_at IS NULL OR processing_started_at < ?))\
             )",
        )
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(campaign_id)
        .bind(lease_expired_before.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_chunk_progress(&self, campaign_id: &str, processed: u64) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE campaign_queues SET chunks_processed = chunks_processed + 1, \
             processed_count = processed_count + ?, updated_at = ? WHERE campaign_id = ?",
        )
        .bind(to_i64(processed))
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found("campaign queue", campaign_id));
        }
        Ok(())
    }

    async fn set_queue_status(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE campaign_queues SET status = ?, last_error = ?, \
             processing_started_at = CASE WHEN ? = 'processing' THEN processing_started_at ELSE NULL END, \
             updated_at = ? WHERE campaign_id = ?",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(status.as_str())
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found("campaign queue", campaign_id));
        }
        Ok(())
    }

    async fn finish_processing(
        &self,
        campaign_id: &str,
        status: QueueStatus,
        last_error: Option<String>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE campaign_queues SET status = ?, last_error = ?, processing_started_at = NULL, updated_at = ? \
             WHERE campaign_id = ? AND status = 'processing'",
        )
        .bind(status.as_str())
        .bind(last_error)
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_queue_entry(&self, campaign_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM campaign_queues WHERE campaign_id = ?")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_live_queues(&self) -> StoreResult<Vec<CampaignQueueEntry>> {
        let query = format!(
            "SELECT {QUEUE_COLUMNS} FROM campaign_queues \
             WHERE status IN ('pending', 'processing') ORDER BY created_at ASC"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_queue_entry).collect()
    }
}
