//! Hourly-bucketed quota bookkeeping and end-of-period auditing.

pub mod audit;
pub mod notify;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use audit::{QuotaAuditor, QuotaViolation, ViolationSeverity, ViolationStore};
pub use notify::ViolationNotifier;
pub use tracker::{QuotaBook, QuotaStatus, QuotaTracker, period_start};
