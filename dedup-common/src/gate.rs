//! The dedup gate decides, one record at a time, whether a record is forwarded.
//!
//! Each decision is a short sequence against the membership store:
//! derive the key, check whether it was seen, claim it, then report `Forwarded`.
//! The gate keeps no state of its own between records.
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use crate::key::{DedupKey, KeyDeriver, MissingFieldError};
use crate::metrics::{
    RECORDS_TOTAL_COUNTER, STORE_OPERATION_DURATION_HISTOGRAM, STORE_READ_ERRORS_TOTAL_COUNTER,
};
use crate::store::{ClaimOutcome, MembershipStore, StoreError};
use crate::Record;

/// How the gate talks to the store for keys it has not seen.
/// CheckThenClaim: `exists` followed by `claim`, two round trips. A failed `exists` is treated as
/// "not found", and the loser of a concurrent claim on the same key drops its record.
/// ClaimIfAbsent: a single conditional insert, which closes the window between check and claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimMode {
    #[default]
    CheckThenClaim,
    ClaimIfAbsent,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseClaimModeError(String);

impl fmt::Display for ParseClaimModeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} is not a valid claim mode", self.0)
    }
}

impl std::error::Error for ParseClaimModeError {}

impl FromStr for ClaimMode {
    type Err = ParseClaimModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "check-then-claim" => Ok(ClaimMode::CheckThenClaim),
            "claim-if-absent" => Ok(ClaimMode::ClaimIfAbsent),
            invalid => Err(ParseClaimModeError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for ClaimMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ClaimMode::CheckThenClaim => write!(f, "check-then-claim"),
            ClaimMode::ClaimIfAbsent => write!(f, "claim-if-absent"),
        }
    }
}

/// Why a record was passed over without consulting the store.
#[derive(Debug, PartialEq, Eq)]
pub enum SkipReason {
    MissingField(MissingFieldError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SkipReason::MissingField(error) => write!(f, "{}", error),
        }
    }
}

/// What the gate decided for one record.
#[derive(Debug)]
pub enum Outcome {
    /// The key was claimed by us; the record should be written out.
    Forwarded,
    /// The key was already claimed.
    DroppedAsDuplicate,
    /// No key could be derived.
    Skipped(SkipReason),
    /// Claiming the key failed. The record was not marked as seen and must not be written.
    Failed(StoreError),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Forwarded => "forwarded",
            Outcome::DroppedAsDuplicate => "duplicate",
            Outcome::Skipped(_) => "skipped",
            Outcome::Failed(_) => "failed",
        }
    }

    pub fn is_forwarded(&self) -> bool {
        matches!(self, Outcome::Forwarded)
    }
}

pub struct DedupGate {
    deriver: KeyDeriver,
    store: Arc<dyn MembershipStore>,
    mode: ClaimMode,
}

impl DedupGate {
    pub fn new(deriver: KeyDeriver, store: Arc<dyn MembershipStore>, mode: ClaimMode) -> Self {
        Self {
            deriver,
            store,
            mode,
        }
    }

    pub fn mode(&self) -> ClaimMode {
        self.mode
    }

    /// Decide what happens to `record`, claiming its key if it is new.
    pub async fn process(&self, record: &Record) -> Outcome {
        let outcome = match self.deriver.derive(record) {
            Ok(key) => match self.mode {
                ClaimMode::CheckThenClaim => self.check_then_claim(&key).await,
                ClaimMode::ClaimIfAbsent => self.claim_if_absent(&key).await,
            },
            Err(error) => Outcome::Skipped(SkipReason::MissingField(error)),
        };

        metrics::counter!(RECORDS_TOTAL_COUNTER, "outcome" => outcome.label()).increment(1);

        outcome
    }

    async fn check_then_claim(&self, key: &DedupKey) -> Outcome {
        match timed("exists", self.store.exists(key)).await {
            Ok(true) => {
                debug!(key = %key, "key already claimed");
                return Outcome::DroppedAsDuplicate;
            }
            Ok(false) => {}
            Err(error) => {
                // Dropping here could lose a record that was never seen; a duplicate is cheaper.
                warn!(error = %error, "membership check failed, claiming anyway");
                metrics::counter!(STORE_READ_ERRORS_TOTAL_COUNTER).increment(1);
            }
        }

        match timed("claim", self.store.claim(key, Utc::now())).await {
            Ok(()) => Outcome::Forwarded,
            Err(error) => Outcome::Failed(error),
        }
    }

    async fn claim_if_absent(&self, key: &DedupKey) -> Outcome {
        match timed("claim_if_absent", self.store.claim_if_absent(key, Utc::now())).await {
            Ok(ClaimOutcome::Created) => Outcome::Forwarded,
            Ok(ClaimOutcome::AlreadyExisted) => {
                debug!(key = %key, "key already claimed");
                Outcome::DroppedAsDuplicate
            }
            Err(error) => Outcome::Failed(error),
        }
    }
}

async fn timed<T>(operation: &'static str, call: impl Future<Output = T>) -> T {
    let start = Instant::now();
    let result = call.await;

    metrics::histogram!(STORE_OPERATION_DURATION_HISTOGRAM, "operation" => operation)
        .record(start.elapsed().as_secs_f64());

    result
}
