//! Credential pool and resilient dispatcher for rate-limited API keys
//!
//! Holds one client per configured API key and runs caller-supplied
//! operations against them with rotation and bounded pool-level retry:
//! 1. `Pool::build` turns the configured keys into clients (bad keys skipped)
//! 2. `Dispatcher::execute` picks a random start and tries each client once
//! 3. First success wins; every failure rotates to the next key
//! 4. If the whole pool failed and the last error is a quota/rate limit with
//!    a short enough suggested wait, sleep and run another pass (budgeted)
//! 5. Otherwise the last attempt's error is returned unchanged
//!
//! The pool is immutable after startup and shared across concurrent calls
//! without locks; each `execute` call keeps its own retry state.

pub mod dispatcher;
pub mod error;
pub mod pool;
pub mod quota;

pub use dispatcher::{Dispatcher, RetryPolicy};
pub use error::{Error, Result};
pub use pool::{Pool, split_credentials};
pub use quota::{ErrorClassification, classify, classify_message, suggested_wait};
