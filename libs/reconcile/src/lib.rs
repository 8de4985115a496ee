//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge desired state to current state. Key concepts:
//!
//! - **Requeue**: what a reconciler tells its dispatcher about re-invocation.
//! - **Retry on conflict**: bounded read-modify-write against versioned records.
//! - **Deadlines**: every remote call is bounded in time.
//!
//! # Invariants
//!
//! - All operations are idempotent
//! - Decisions are deterministic given the same inputs
//! - No helper sleeps inside the hot path except the explicit conflict backoff

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use thiserror::Error;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for an operation.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// Conflict retries exhausted (concurrent modification).
    #[error("conflict: gave up on {resource} after {attempts} attempts")]
    ConflictRetriesExhausted { resource: String, attempts: u32 },
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (current matches desired).
    Converged,

    /// Resource is converging (current is moving toward desired).
    Converging,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

/// Requeue interval while work is in progress.
pub const SHORT_REQUEUE_INTERVAL: Duration = Duration::from_secs(15);

/// Requeue interval after a failed status write.
pub const MEDIUM_REQUEUE_INTERVAL: Duration = Duration::from_secs(60);

/// Requeue interval once retries are exhausted.
pub const LONG_REQUEUE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// What the dispatcher should do after a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Requeue {
    after: Option<Duration>,
}

impl Requeue {
    /// Do not requeue; the resource is in a terminal or steady state.
    pub const fn done() -> Self {
        Self { after: None }
    }

    /// Requeue after a custom interval.
    pub const fn after(interval: Duration) -> Self {
        Self {
            after: Some(interval),
        }
    }

    /// Requeue after the short interval.
    pub const fn short() -> Self {
        Self::after(SHORT_REQUEUE_INTERVAL)
    }

    /// Requeue after the medium interval.
    pub const fn medium() -> Self {
        Self::after(MEDIUM_REQUEUE_INTERVAL)
    }

    /// Requeue after the long interval.
    pub const fn long() -> Self {
        Self::after(LONG_REQUEUE_INTERVAL)
    }

    /// Requested delay, if any.
    pub fn requeue_after(&self) -> Option<Duration> {
        self.after
    }

    /// Returns true if no further invocation is requested.
    pub fn is_done(&self) -> bool {
        self.after.is_none()
    }
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when a request's desired state has been edited.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if `other` is the string form of this hash.
    pub fn matches(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Run a future under a deadline.
pub async fn with_deadline<T, F>(resource: &str, deadline: Duration, fut: F) -> Result<T, ReconcileError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(deadline, fut)
        .await
        .map_err(|_| ReconcileError::Timeout {
            resource: resource.to_string(),
            elapsed: deadline,
        })
}

/// Bounded retry policy for optimistic-concurrency conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,

    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_CONFLICT_ATTEMPTS,
            backoff: Duration::from_millis(10),
        }
    }
}

/// Outcome of [`retry_on_conflict`] when it does not succeed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with a non-conflict error.
    Failed(E),

    /// Every attempt hit a conflict.
    Exhausted { attempts: u32, last: E },
}

/// Re-run `op` while it fails with an error `is_conflict` accepts.
///
/// `op` must re-read the versioned record on every attempt; the helper only
/// decides whether another attempt is allowed.
pub async fn retry_on_conflict<T, E, F, Fut, C>(
    policy: RetryPolicy,
    is_conflict: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_conflict(&e) => {
                if attempt >= attempts {
                    return Err(RetryError::Exhausted { attempts, last: e });
                }
                tracing::debug!(attempt, attempts, "Conflict detected, retrying");
                if !policy.backoff.is_zero() {
                    tokio::time::sleep(policy.backoff).await;
                }
            }
            Err(e) => return Err(RetryError::Failed(e)),
        }
    }
}

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        let now = Instant::now();
        if now.duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default periodic resync interval.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Default conflict attempts per read-modify-write.
pub const DEFAULT_CONFLICT_ATTEMPTS: u32 = 5;

/// Default deadline for a single store call.
pub const DEFAULT_CALL_DEADLINE: Duration = Duration::from_secs(5);

/// Default retry limit per resource before backing off to the long interval.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes
