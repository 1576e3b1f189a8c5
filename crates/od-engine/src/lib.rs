//! Outdial Campaign Dispatch Engine
//!
//! - Business hours gate and provider block rules
//! - Recipient state machine with compare-and-set transitions
//! - Campaign queue: persisted chunk progress and per-campaign lease
//! - Chunk processor and campaign lifecycle (start, resume, pause, cancel, drive)
//! - Stale recipient sweep and background campaign driver
//!
//! Persistence goes through [`store::CampaignStore`]; an in-memory store is
//! always available and a SQLite one behind the `sqlite` feature.

pub mod business_hours;
pub mod chunk_processor;
pub mod driver;
pub mod error;
pub mod queue;
pub mod recipient_state;
pub mod stale_recovery;
pub mod store;

pub use business_hours::{compile_block_rules, BusinessHoursError, BusinessHoursEvaluator, NextWindow};
pub use chunk_processor::{
    ChunkCounts, ChunkOutcome, ChunkProcessor, ChunkProcessorConfig, ChunkResult, DriveSummary,
    StartCampaignResponse, StartOptions, OUTSIDE_BUSINESS_HOURS,
};
pub use driver::{CampaignDriver, DriveRecord, DriveState, DriverConfig, SubmitOutcome};
pub use error::{EngineError, Result, StoreError};
pub use queue::CampaignQueue;
pub use recipient_state::{CallResult, CallResultOutcome, RecipientStateMachine};
pub use stale_recovery::{StaleRecipientSweeper, SweepReport, SweeperConfig};
pub use store::{CampaignStore, CounterDelta, MemoryCampaignStore, Placement, RecipientTransition, StaleQuery};
#[cfg(feature = "sqlite")]
pub use store::SqliteCampaignStore;
