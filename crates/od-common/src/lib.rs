//! Outdial shared domain model
//!
//! Entities exchanged between the dispatch engine, the provider gateway and the
//! record-management collaborators (campaign CRUD, CSV import, webhooks).

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod logging;

// ============================================================================
// Campaign
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Ready,
    Scheduled,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Ready => "ready",
            Self::Scheduled => "scheduled",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// No further dispatch happens from a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Statuses from which a chunked run may be started
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Ready | Self::Scheduled | Self::Paused | Self::Active)
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "ready" => Ok(Self::Ready),
            "scheduled" => Ok(Self::Scheduled),
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid campaign status: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    #[default]
    Immediate,
    Scheduled,
}

impl ScheduleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Immediate => "immediate",
            Self::Scheduled => "scheduled",
        }
    }
}

impl FromStr for ScheduleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "scheduled" => Ok(Self::Scheduled),
            _ => Err(format!("Invalid schedule type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub workspace_id: String,
    pub agent_id: String,
    pub name: String,
    /// Outbound caller id (E.164); falls back to the agent's caller id
    #[serde(default)]
    pub caller_id: Option<String>,
    pub status: CampaignStatus,
    pub total_recipients: u64,
    pub pending_recipients: u64,
    pub successful_recipients: u64,
    pub failed_recipients: u64,
    #[serde(default)]
    pub schedule_type: ScheduleType,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub business_hours: BusinessHoursConfig,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(workspace_id: impl Into<String>, agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            agent_id: agent_id.into(),
            name: name.into(),
            caller_id: None,
            status: CampaignStatus::Ready,
            total_recipients: 0,
            pending_recipients: 0,
            successful_recipients: 0,
            failed_recipients: 0,
            schedule_type: ScheduleType::Immediate,
            start_at: None,
            expires_at: None,
            business_hours: BusinessHoursConfig::default(),
            timezone: "UTC".to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Batch reference correlating this campaign with a primary provider submission
    pub fn batch_ref(&self) -> String {
        format!("campaign-{}", self.id)
    }
}

// ============================================================================
// Recipient
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Queued,
    Calling,
    Completed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Calling => "calling",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "calling" => Ok(Self::Calling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid call status: {s}")),
        }
    }
}

/// Contact fields used as call template variables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactDetails {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub company_name: Option<String>,
    pub reason_for_call: Option<String>,
    pub address: Option<String>,
    pub address_line_2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub post_code: Option<String>,
    pub country: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    pub id: String,
    pub campaign_id: String,
    pub phone_number: String,
    #[serde(default)]
    pub contact: ContactDetails,
    pub call_status: CallStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub external_call_id: Option<String>,
    /// Instant the provider holds the call until, for batches submitted with
    /// a future start
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Recipient {
    pub fn new(campaign_id: impl Into<String>, phone_number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            phone_number: phone_number.into(),
            contact: ContactDetails::default(),
            call_status: CallStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            external_call_id: None,
            scheduled_for: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Instant from which a `calling` recipient can be considered lost: its
    /// last status change, or the scheduled dial time when that is later
    pub fn stale_since(&self) -> DateTime<Utc> {
        self.scheduled_for.map_or(self.updated_at, |at| at.max(self.updated_at))
    }

    pub fn with_contact(mut self, contact: ContactDetails) -> Self {
        self.contact = contact;
        self
    }
}

// ============================================================================
// Voice agent and provider bindings
// ============================================================================

/// Credentials binding an agent to one voice provider.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderBinding {
    Primary {
        external_agent_id: String,
        api_key: String,
    },
    Secondary {
        external_agent_id: String,
        api_key: String,
        phone_number_id: String,
    },
}

impl fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary { external_agent_id, .. } => f
                .debug_struct("Primary")
                .field("external_agent_id", external_agent_id)
                .field("api_key", &"<redacted>")
                .finish(),
            Self::Secondary { external_agent_id, phone_number_id, .. } => f
                .debug_struct("Secondary")
                .field("external_agent_id", external_agent_id)
                .field("phone_number_id", phone_number_id)
                .field("api_key", &"<redacted>")
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceAgent {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub bindings: Vec<ProviderBinding>,
}

// ============================================================================
// Business hours
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayOfWeek {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl DayOfWeek {
    pub const ALL: [DayOfWeek; 7] = [
        Self::Monday,
        Self::Tuesday,
        Self::Wednesday,
        Self::Thursday,
        Self::Friday,
        Self::Saturday,
        Self::Sunday,
    ];

    /// Three-letter form used in provider block rules
    pub fn abbrev(&self) -> &'static str {
        match self {
            Self::Monday => "Mon",
            Self::Tuesday => "Tue",
            Self::Wednesday => "Wed",
            Self::Thursday => "Thu",
            Self::Friday => "Fri",
            Self::Saturday => "Sat",
            Self::Sunday => "Sun",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Monday => "Monday",
            Self::Tuesday => "Tuesday",
            Self::Wednesday => "Wednesday",
            Self::Thursday => "Thursday",
            Self::Friday => "Friday",
            Self::Saturday => "Saturday",
            Self::Sunday => "Sunday",
        }
    }
}

impl From<Weekday> for DayOfWeek {
    fn from(day: Weekday) -> Self {
        match day {
            Weekday::Mon => Self::Monday,
            Weekday::Tue => Self::Tuesday,
            Weekday::Wed => Self::Wednesday,
            Weekday::Thu => Self::Thursday,
            Weekday::Fri => Self::Friday,
            Weekday::Sat => Self::Saturday,
            Weekday::Sun => Self::Sunday,
        }
    }
}

/// One open window within a day, 24h "HH:MM" strings. `end` may be "24:00".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start: String,
    pub end: String,
}

impl TimeSlot {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self { start: start.into(), end: end.into() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessHoursConfig {
    pub enabled: bool,
    /// IANA zone name; empty falls back to the campaign timezone
    #[serde(default)]
    pub timezone: Option<String>,
    /// Days missing from the map are closed all day
    #[serde(default)]
    pub schedule: BTreeMap<DayOfWeek, Vec<TimeSlot>>,
}

impl BusinessHoursConfig {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn with_day(mut self, day: DayOfWeek, slots: Vec<TimeSlot>) -> Self {
        self.schedule.insert(day, slots);
        self
    }

    pub fn slots(&self, day: DayOfWeek) -> &[TimeSlot] {
        self.schedule.get(&day).map(Vec::as_slice).unwrap_or(&[])
    }
}

// ============================================================================
// Campaign queue
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Paused,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid queue status: {s}")),
        }
    }
}

/// Dispatch tuning captured when a campaign queue is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizedBatchConfig {
    /// Simultaneous in-flight provider calls
    pub concurrency_limit: usize,
    pub max_attempts: u32,
    pub retry_delay_minutes: u32,
    pub delay_between_chunks_ms: u64,
    pub delay_between_calls_ms: u64,
    /// Wall-clock budget of one chunk invocation
    pub max_processing_time_ms: u64,
}

impl Default for OptimizedBatchConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 5,
            max_attempts: 3,
            retry_delay_minutes: 30,
            delay_between_chunks_ms: 1000,
            delay_between_calls_ms: 100,
            max_processing_time_ms: 25_000,
        }
    }
}

impl OptimizedBatchConfig {
    pub fn delay_between_calls(&self) -> Duration {
        Duration::from_millis(self.delay_between_calls_ms)
    }

    pub fn delay_between_chunks(&self) -> Duration {
        Duration::from_millis(self.delay_between_chunks_ms)
    }

    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.retry_delay_minutes) * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignQueueEntry {
    pub campaign_id: String,
    pub workspace_id: String,
    pub total_recipients: u64,
    pub chunk_size: u32,
    pub total_chunks: u64,
    pub chunks_processed: u64,
    pub processed_count: u64,
    pub status: QueueStatus,
    pub batch_config: OptimizedBatchConfig,
    pub last_error: Option<String>,
    /// Set while an invocation holds the entry in `processing`
    pub processing_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignQueueEntry {
    pub fn new(
        campaign_id: impl Into<String>,
        workspace_id: impl Into<String>,
        total_recipients: u64,
        chunk_size: u32,
        batch_config: OptimizedBatchConfig,
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        let now = Utc::now();
        Self {
            campaign_id: campaign_id.into(),
            workspace_id: workspace_id.into(),
            total_recipients,
            chunk_size,
            total_chunks: total_chunks_for(total_recipients, chunk_size),
            chunks_processed: 0,
            processed_count: 0,
            status: QueueStatus::Pending,
            batch_config,
            last_error: None,
            processing_started_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total_recipients == 0 {
            return 100.0;
        }
        (self.processed_count as f64 / self.total_recipients as f64 * 100.0).min(100.0)
    }
}

/// ceil(total / chunk_size)
pub fn total_chunks_for(total_recipients: u64, chunk_size: u32) -> u64 {
    let chunk = u64::from(chunk_size.max(1));
    total_recipients.div_ceil(chunk)
}
