//! Application layer: the reconciliation engine and its compensations.
//!
//! [`engine::ReconciliationEngine`] is the single entry point. Creation and
//! verification live in `engine`, the callback path in `callbacks` and
//! refund bookkeeping in `refunds`; all three commit status changes through
//! the same compare-and-swap guard.

pub mod callbacks;
pub mod compensation;
pub mod engine;
pub mod refunds;
