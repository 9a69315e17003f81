//! # flowdoc-app — workflow documentation client
//!
//! Ties the data model and the sync layer into one application:
//!
//! - [`store`] — the Workflow State Store, single source of truth for the
//!   authoring form and saved submissions
//! - [`analysis`] — analysis generator seam with a local fallback
//! - [`context`] — constructs and wires every service
//! - [`config`] — defaults plus `FLOWDOC_*` environment overrides

pub mod analysis;
pub mod config;
pub mod context;
pub mod store;

pub use analysis::{
    extract_hourly_rate, AnalysisError, AnalysisGenerator, AnalysisResponse, FallbackGenerator,
    LocalAnalysis, DEFAULT_HOURLY_RATE,
};
pub use config::{AppConfig, ConfigError};
pub use context::{AppContext, AppError, Services};
pub use store::{
    FormPhase, RemoteOutcome, StoreConfig, StoreServices, SubmitError, WorkflowState,
    WorkflowStore, SNAPSHOT_PATH,
};
