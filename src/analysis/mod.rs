//! # Relational Analysis
//!
//! Periodic analysis of how a session's feature records evolve over time.
//!
//! ## Key Components:
//! - **History**: the bounded sliding window and the shared, append-only session history
//! - **Engine**: the `RelationalAnalyzer` that turns both into an `AnalysisReport`
//! - **Report**: serializable report types sent to clients
//! - **Stats**: regression, peak picking and other small numeric helpers

pub mod engine;    // RelationalAnalyzer
pub mod history;   // SlidingWindow, FullHistory, ReportHistory
pub mod report;    // AnalysisReport and its sections
pub mod stats;     // Numeric helpers

pub use engine::RelationalAnalyzer;
pub use history::{FullHistory, ReportHistory};
pub use report::AnalysisReport;
