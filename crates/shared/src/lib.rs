//! PlanGuard Shared Types and Utilities
//!
//! This crate contains the plan/subscription value types, validation errors and
//! database helpers shared across the PlanGuard workspace.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
