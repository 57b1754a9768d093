//! Quota & Rate Limiter accounting (component C6, monthly half).
//!
//! This crate is the reduced successor to the teacher's `crates/billing`:
//! the Stripe-integrated subscription/checkout/webhook surface is dropped
//! (payment capture and reconciliation are out of scope), but the
//! usage-accounting and spend-cap shapes that `routes/mcp_proxy.rs` reads at
//! proxy time are kept and generalized away from Stripe specifics.

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod error;
pub mod invariants;
pub mod spend_cap;
pub mod usage;

pub use error::{QuotaError, QuotaResult};
pub use invariants::{InvariantChecker, InvariantCheckSummary, InvariantViolation, ViolationSeverity};
pub use spend_cap::{SpendCap, SpendCapCheck};
pub use usage::{AdmissionDecision, UsageMeter};
