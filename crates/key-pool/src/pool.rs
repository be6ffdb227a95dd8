//! Credential state and least-used selection
//!
//! All per-credential state lives in one `Vec` behind a single `RwLock`, so a
//! select or update is one critical section. Two concurrent tasks can never
//! interleave a check and an act on the same counters.
//!
//! A credential is excluded from selection for one of two reasons:
//! - it failed authorization or hit a 429 (`mark_failed`)
//! - its server-reported usage reached the monthly limit (`update_usage`)
//!
//! Both set `disabled`; the reason decides whether an empty selection reports
//! `PoolExhausted` or `QuotaExhausted`.

use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One configured API key.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub secret: Secret<String>,
    /// Overrides the pool-wide monthly limit.
    pub monthly_limit: Option<u64>,
}

impl CredentialConfig {
    pub fn new(secret: impl Into<Secret<String>>) -> Self {
        Self {
            secret: secret.into(),
            monthly_limit: None,
        }
    }

    pub fn with_limit(mut self, limit: u64) -> Self {
        self.monthly_limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisabledReason {
    Failed,
    LimitReached,
}

#[derive(Debug)]
struct CredentialState {
    secret: Secret<String>,
    fingerprint: String,
    monthly_limit: u64,
    usage: Option<u64>,
    disabled: Option<DisabledReason>,
    last_error: Option<String>,
    last_updated: Option<u64>,
}

impl CredentialState {
    fn at_limit(&self) -> bool {
        self.usage.is_some_and(|u| u >= self.monthly_limit)
    }

    fn usable(&self) -> bool {
        self.disabled.is_none() && !self.at_limit()
    }

    fn remaining(&self) -> Option<u64> {
        self.usage.map(|u| self.monthly_limit.saturating_sub(u))
    }
}

#[derive(Debug)]
struct PoolState {
    credentials: Vec<CredentialState>,
    current: usize,
}

/// A credential picked for one attempt.
#[derive(Debug, Clone)]
pub struct SelectedCredential {
    pub index: usize,
    pub secret: Secret<String>,
    /// `None` while the server has not reported usage yet.
    pub remaining: Option<u64>,
}

/// Outcome of recording a server usage counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageUpdate {
    pub index: usize,
    pub used: u64,
    pub remaining: u64,
    pub limit: u64,
    /// True when this update pushed the credential over its limit.
    pub newly_disabled: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub index: usize,
    pub fingerprint: String,
    pub usage: Option<u64>,
    pub limit: u64,
    pub remaining: Option<u64>,
    pub percent_used: Option<f64>,
    pub disabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolTotals {
    /// Sum of known usage counters.
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// Read-only view of the pool. Secrets appear only as fingerprints.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    /// "healthy", "degraded" or "unhealthy"
    pub status: &'static str,
    pub current: usize,
    pub credentials_total: usize,
    pub credentials_available: usize,
    pub credentials_disabled: usize,
    pub credentials: Vec<CredentialSnapshot>,
    /// Omitted until at least one credential has reported usage.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals: Option<PoolTotals>,
}

/// Pool of API credentials sharing a monthly cap.
pub struct Pool {
    state: RwLock<PoolState>,
    size: usize,
}

impl Pool {
    /// Build a pool. `default_limit` applies to credentials without their own.
    ///
    /// Fails with `NoCredentials` on an empty list.
    pub fn new(credentials: Vec<CredentialConfig>, default_limit: u64) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::NoCredentials);
        }
        let credentials: Vec<CredentialState> = credentials
            .into_iter()
            .map(|c| CredentialState {
                fingerprint: c.secret.fingerprint(),
                secret: c.secret,
                monthly_limit: c.monthly_limit.unwrap_or(default_limit),
                usage: None,
                disabled: None,
                last_error: None,
                last_updated: None,
            })
            .collect();
        let size = credentials.len();
        info!(credentials = size, default_limit, "credential pool initialized");
        Ok(Self {
            state: RwLock::new(PoolState {
                credentials,
                current: 0,
            }),
            size,
        })
    }

    /// Number of credentials; fixed for the pool's lifetime.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Pick the usable credential with the most quota left.
    ///
    /// Unknown usage ranks above any known remaining quota. Ties go to the
    /// lower index.
    pub async fn select(&self) -> Result<SelectedCredential> {
        let mut state = self.state.write().await;
        Self::select_locked(&mut state)
    }

    /// Pick credential `index` again if it is still usable, otherwise fall
    /// back to `select()`.
    pub async fn select_index(&self, index: usize) -> Result<SelectedCredential> {
        let mut state = self.state.write().await;
        let len = state.credentials.len();
        let cred = state
            .credentials
            .get(index)
            .ok_or(Error::InvalidIndex { index, len })?;
        if cred.usable() {
            let selected = SelectedCredential {
                index,
                secret: cred.secret.clone(),
                remaining: cred.remaining(),
            };
            state.current = index;
            debug!(index, "credential reselected");
            return Ok(selected);
        }
        debug!(index, "pinned credential no longer usable, reselecting");
        Self::select_locked(&mut state)
    }

    fn select_locked(state: &mut PoolState) -> Result<SelectedCredential> {
        let total = state.credentials.len();
        let enabled: Vec<(usize, &CredentialState)> = state
            .credentials
            .iter()
            .enumerate()
            .filter(|(_, c)| c.disabled != Some(DisabledReason::Failed))
            .collect();
        if enabled.is_empty() {
            return Err(Error::PoolExhausted {
                total,
                disabled: total,
            });
        }

        // `None` remaining (unknown usage) sorts above every `Some`.
        let mut best: Option<(usize, Option<u64>)> = None;
        for (index, cred) in enabled.iter().filter(|(_, c)| c.usable()) {
            let remaining = cred.remaining();
            let better = match best {
                None => true,
                Some((_, None)) => false,
                Some((_, Some(best_rem))) => match remaining {
                    None => true,
                    Some(r) => r > best_rem,
                },
            };
            if better {
                best = Some((*index, remaining));
            }
        }

        let Some((index, remaining)) = best else {
            return Err(Error::QuotaExhausted {
                total,
                at_limit: enabled.len(),
            });
        };

        state.current = index;
        debug!(index, remaining = ?remaining, "credential selected");
        Ok(SelectedCredential {
            index,
            secret: state.credentials[index].secret.clone(),
            remaining,
        })
    }

    /// Record the server-reported usage counter for `index`.
    ///
    /// `None` is a no-op: a response without the header must not erase a
    /// known count. Counts only move up; a lower value from an out-of-order
    /// response is ignored.
    pub async fn update_usage(&self, index: usize, usage: Option<u64>) -> Result<Option<UsageUpdate>> {
        let mut state = self.state.write().await;
        let len = state.credentials.len();
        let cred = state
            .credentials
            .get_mut(index)
            .ok_or(Error::InvalidIndex { index, len })?;

        let Some(reported) = usage else {
            return Ok(None);
        };

        let used = match cred.usage {
            Some(current) if reported < current => {
                debug!(index, reported, current, "ignoring stale usage counter");
                current
            }
            _ => reported,
        };
        cred.usage = Some(used);
        cred.last_updated = Some(now_millis());

        let mut newly_disabled = false;
        if used >= cred.monthly_limit && cred.disabled.is_none() {
            cred.disabled = Some(DisabledReason::LimitReached);
            newly_disabled = true;
            info!(index, used, limit = cred.monthly_limit, "credential reached monthly limit");
        }

        Ok(Some(UsageUpdate {
            index,
            used,
            remaining: cred.monthly_limit.saturating_sub(used),
            limit: cred.monthly_limit,
            newly_disabled,
        }))
    }

    /// Disable `index` after an authorization or quota rejection.
    pub async fn mark_failed(&self, index: usize, error: impl Into<String>) -> Result<()> {
        let mut state = self.state.write().await;
        let len = state.credentials.len();
        let cred = state
            .credentials
            .get_mut(index)
            .ok_or(Error::InvalidIndex { index, len })?;
        let error = error.into();
        warn!(index, error = %error, "credential disabled");
        cred.disabled = Some(DisabledReason::Failed);
        cred.last_error = Some(error);
        cred.last_updated = Some(now_millis());
        Ok(())
    }

    /// Forget all usage and failures, e.g. when the billing period rolls over.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        for cred in state.credentials.iter_mut() {
            cred.usage = None;
            cred.disabled = None;
            cred.last_error = None;
            cred.last_updated = None;
        }
        state.current = 0;
        info!(credentials = state.credentials.len(), "credential pool reset");
    }

    /// Index of the most recently selected credential (0 before any selection).
    pub async fn current_index(&self) -> usize {
        self.state.read().await.current
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.read().await;

        let credentials: Vec<CredentialSnapshot> = state
            .credentials
            .iter()
            .enumerate()
            .map(|(index, c)| CredentialSnapshot {
                index,
                fingerprint: c.fingerprint.clone(),
                usage: c.usage,
                limit: c.monthly_limit,
                remaining: c.remaining(),
                percent_used: c.usage.map(|u| percent(u, c.monthly_limit)),
                disabled: c.disabled.is_some(),
                last_error: c.last_error.clone(),
                last_updated: c.last_updated,
            })
            .collect();

        let total = state.credentials.len();
        let available = state.credentials.iter().filter(|c| c.usable()).count();

        let totals = if state.credentials.iter().any(|c| c.usage.is_some()) {
            let used: u64 = state.credentials.iter().filter_map(|c| c.usage).sum();
            let limit: u64 = state.credentials.iter().map(|c| c.monthly_limit).sum();
            Some(PoolTotals {
                used,
                limit,
                remaining: limit.saturating_sub(used),
            })
        } else {
            None
        };

        let status = if available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        PoolSnapshot {
            status,
            current: state.current,
            credentials_total: total,
            credentials_available: available,
            credentials_disabled: total - available,
            credentials,
            totals,
        }
    }
}

fn percent(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    (used as f64 / limit as f64 * 100.0).min(100.0)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
