//! PlanGuard Plan-Change Impact & Migration Engine
//!
//! This crate tells an operator what a plan change would do before it is made.
//! It analyzes the impact on every bound subscription, classifies the risk,
//! drafts and executes a reversible migration, and records each step in an
//! append-only change ledger.

pub mod analyzer;
pub mod classifier;
pub mod config;
pub mod error;
pub mod executor;
pub mod impact;
pub mod ledger;
pub mod memory;
pub mod migration;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod repository;
pub mod telemetry;

pub use analyzer::{AnalysisOptions, AnalyzerSettings, ImpactAnalyzer};
pub use classifier::{RiskAssessment, RiskClassifier, RiskLevel, RiskTable, RiskThreshold};
pub use config::{ConfigError, EngineConfig};
pub use error::{EngineError, EngineResult};
pub use impact::{
    AffectedSubscription, ChangeType, ImpactAnalysis, ImpactMetrics, PlanDiff, RecommendedAction,
};
pub use ledger::{
    ChangeLedger, ChangeRecord, InMemoryChangeLedger, InMemoryMigrationStore, LedgerEntry,
    MigrationStore, NewChangeRecord, PgChangeLedger, PgMigrationStore,
};
pub use memory::{InMemoryPlanRepository, InMemorySubscriptionRepository};
pub use migration::{MigrationPlan, MigrationStatus, StepKind, StepStatus};
pub use notify::{notifier_from_config, HttpNotifier, NoopNotifier, Notifier, RecordingNotifier};
pub use orchestrator::{Collaborators, Orchestrator};
pub use planner::MigrationPlanner;
pub use repository::{PlanRepository, Shard, SubscriptionRepository};
pub use telemetry::{init_tracing, TelemetryConfig};
