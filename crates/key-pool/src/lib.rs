//! Credential pool for a metered image compression API
//!
//! Holds several API keys that share a monthly compression cap and picks the
//! one with the most quota left. The server's usage counter is the only
//! source of truth; the pool never increments it locally.
//!
//! Credential lifecycle:
//! 1. Loaded at startup with unknown usage
//! 2. `select()` prefers unknown usage, then the most remaining quota
//! 3. Each response reports the server counter → `update_usage()`
//! 4. Counter reaches the monthly limit → disabled
//! 5. 401/403/429 from the service → `mark_failed()` → disabled
//! 6. Billing period rolls over → caller invokes `reset()`

pub mod classify;
pub mod error;
pub mod pool;

pub use classify::{
    Classification, ErrorKind, RetryDecision, backoff_delay, classify, classify_status,
};
pub use error::{Error, Result};
pub use pool::{
    CredentialConfig, CredentialSnapshot, Pool, PoolSnapshot, PoolTotals, SelectedCredential,
    UsageUpdate,
};
