//! Per-(run, step) retry state with exponential backoff and jitter.
//!
//! The controller computes and records; it never sleeps. The dispatcher owns
//! the actual retry timers and feeds the controller's computed delay into a
//! cancellable `tokio::time::sleep`.

use crate::store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;

/// Dispatch-unit key within a run: `phase * 100_000 + hash(task_id) % 100_000`.
///
/// The hash keeps the key stable across restarts while leaving the phase
/// recoverable by integer division.
pub fn step_order(phase_number: u32, task_id: &str) -> u64 {
    let digest = Sha256::digest(task_id.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hashed = u64::from_be_bytes(prefix) % 100_000;
    u64::from(phase_number) * 100_000 + hashed
}

/// Backoff policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// One recorded attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    #[default]
    Pending,
    Retrying,
    Exhausted,
    Succeeded,
}

/// Attempt history for one (run, step).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryState {
    pub run_id: String,
    pub step_order: u64,
    pub policy: RetryPolicy,
    pub attempts: Vec<Attempt>,
    pub status: RetryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// What [`RetryController::record_attempt`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Exhausted,
    Retrying { delay_ms: u64 },
}

fn state_key(run_id: &str, step: u64) -> String {
    format!("{run_id}:{step}")
}

/// Uniform jitter in [-10%, +10%] of `delay`, derived from the clock's
/// nanosecond component (no RNG dependency; the bound is what matters).
fn jitter(delay: f64) -> f64 {
    let nanos = Utc::now().timestamp_subsec_nanos();
    let frac = f64::from(nanos % 1_000) / 1_000.0;
    (frac - 0.5) * 2.0 * 0.1 * delay
}

/// JSON-file-backed retry controller.
pub struct RetryController {
    path: PathBuf,
    states: HashMap<String, RetryState>,
    loaded: bool,
}

impl RetryController {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            states: HashMap::new(),
            loaded: false,
        }
    }

    fn load(&mut self) -> Result<()> {
        if self.loaded {
            return Ok(());
        }
        self.states = store::read_json(&self.path)?.unwrap_or_default();
        self.loaded = true;
        Ok(())
    }

    fn save(&self) -> Result<()> {
        store::write_json_atomic(&self.path, &self.states)
    }

    /// Create the entry if absent; existing state is untouched.
    pub fn init_state(
        &mut self,
        run_id: &str,
        step: u64,
        policy: RetryPolicy,
    ) -> Result<RetryState> {
        self.load()?;
        let key = state_key(run_id, step);
        if !self.states.contains_key(&key) {
            self.states.insert(
                key.clone(),
                RetryState {
                    run_id: run_id.to_string(),
                    step_order: step,
                    policy,
                    attempts: Vec::new(),
                    status: RetryStatus::Pending,
                    next_retry_at: None,
                },
            );
            self.save()?;
        }
        Ok(self.states[&key].clone())
    }

    pub fn get(&mut self, run_id: &str, step: u64) -> Result<Option<RetryState>> {
        self.load()?;
        Ok(self.states.get(&state_key(run_id, step)).cloned())
    }

    pub fn is_exhausted(&mut self, run_id: &str, step: u64) -> Result<bool> {
        Ok(self
            .get(run_id, step)?
            .is_some_and(|s| s.status == RetryStatus::Exhausted))
    }

    /// Append an attempt and recompute the state.
    ///
    /// The scheduled delay for the n-th consecutive failure is
    /// `min(max_delay, floor(base * multiplier^(n-1) + jitter))` with jitter
    /// uniform in ±10% of the undamped delay.
    pub fn record_attempt(
        &mut self,
        run_id: &str,
        step: u64,
        success: bool,
        error: Option<String>,
        duration_ms: Option<u64>,
    ) -> Result<AttemptOutcome> {
        self.load()?;
        let key = state_key(run_id, step);
        let state = self.states.entry(key).or_insert_with(|| RetryState {
            run_id: run_id.to_string(),
            step_order: step,
            policy: RetryPolicy::default(),
            attempts: Vec::new(),
            status: RetryStatus::Pending,
            next_retry_at: None,
        });

        state.attempts.push(Attempt {
            at: Utc::now(),
            success,
            error,
            duration_ms,
        });

        let outcome = if success {
            state.status = RetryStatus::Succeeded;
            state.next_retry_at = None;
            AttemptOutcome::Succeeded
        } else if state.attempts.len() as u32 >= state.policy.max_attempts {
            state.status = RetryStatus::Exhausted;
            state.next_retry_at = None;
            AttemptOutcome::Exhausted
        } else {
            let failures = state.attempts.len() as u32;
            let raw = state.policy.base_delay_ms as f64
                * state.policy.backoff_multiplier.powi(failures as i32 - 1);
            let delay_ms =
                ((raw + jitter(raw)).floor() as u64).min(state.policy.max_delay_ms);
            state.status = RetryStatus::Retrying;
            state.next_retry_at =
                Some(Utc::now() + chrono::Duration::milliseconds(delay_ms as i64));
            AttemptOutcome::Retrying { delay_ms }
        };

        self.save()?;
        Ok(outcome)
    }

    /// Remove the entry (used when a retried step eventually succeeds and its
    /// history is no longer interesting).
    pub fn clear_state(&mut self, run_id: &str, step: u64) -> Result<()> {
        self.load()?;
        if self.states.remove(&state_key(run_id, step)).is_some() {
            self.save()?;
        }
        Ok(())
    }

    /// All non-terminal states for a run, for resume-on-restart.
    pub fn by_run(&mut self, run_id: &str) -> Result<Vec<RetryState>> {
        self.load()?;
        Ok(self
            .states
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }
}
