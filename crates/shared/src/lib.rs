#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CoachPay Shared Types and Utilities
//!
//! Domain vocabulary, pagination, clock abstraction and database helpers shared
//! by the billing core, the API server and the background worker.

pub mod clock;
pub mod db;
pub mod error;
pub mod types;

pub use clock::{Clock, FakeClock, SystemClock};
pub use db::*;
pub use error::*;
pub use types::*;
