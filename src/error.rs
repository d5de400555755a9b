// =============================================================================
// Error taxonomy — what recovers locally, what halts the engine
// =============================================================================
//
// POLICY: only three classes are process-fatal: signature/credential errors,
// journal write failures, and unrecoverable clock drift. Everything else is
// handled where it occurs (retry, cool-down, or terminal FAILED intent).
// =============================================================================

use thiserror::Error;
use uuid::Uuid;

/// The three conditions that end the process, with their exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Bad credentials or signature: exit 2.
    Credentials,
    /// Journal unwritable: exit 3.
    Journal,
    /// Unrecoverable clock drift: exit 4.
    Clock,
}

impl FatalKind {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Credentials => 2,
            Self::Journal => 3,
            Self::Clock => 4,
        }
    }
}

impl std::fmt::Display for FatalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Credentials => write!(f, "credentials"),
            Self::Journal => write!(f, "journal"),
            Self::Clock => write!(f, "clock"),
        }
    }
}

/// Typed failure from the venue client. Every REST call resolves to exactly
/// one of these.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Transport-level fault: the request may or may not have reached the
    /// venue. Callers must not assume the order failed.
    #[error("venue network error: {0}")]
    Network(String),

    /// HTTP 429/418. The limiter enters cool-down for `retry_after_secs`.
    #[error("venue rate limit hit, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// The venue understood and refused the request.
    #[error("venue rejected request (code {code}): {message}")]
    Rejected { code: i64, message: String },

    /// Bad credentials or signature. Fatal: the engine halts.
    #[error("signature/credential error: {0}")]
    Signature(String),

    /// Local clock diverged from venue server time beyond the allowed bound.
    /// Signed calls are refused until a resync succeeds.
    #[error("clock drift {drift_ms}ms exceeds limit {limit_ms}ms")]
    ClockDrift { drift_ms: i64, limit_ms: i64 },

    /// The circuit breaker for this endpoint class is open.
    #[error("circuit open for {class}, retry in {retry_in_secs}s")]
    CircuitOpen {
        class: &'static str,
        retry_in_secs: u64,
    },

    /// Anything that does not fit the taxonomy above.
    #[error("unexpected venue failure: {0}")]
    Unknown(String),
}

impl VenueError {
    /// The fatal class this error belongs to, if any.
    pub fn fatal_kind(&self) -> Option<FatalKind> {
        match self {
            Self::Signature(_) => Some(FatalKind::Credentials),
            Self::ClockDrift { .. } => Some(FatalKind::Clock),
            _ => None,
        }
    }

    /// Whether this error must halt the whole engine.
    pub fn is_fatal(&self) -> bool {
        self.fatal_kind().is_some()
    }
}

/// Failures from the write-ahead journal. Any write-side failure poisons the
/// log: no new intents may be recorded, and the engine halts.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal serialisation error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A previous write or fsync failed. All subsequent appends are refused.
    #[error("journal poisoned by an earlier write failure")]
    Poisoned,
}

/// Why the striker refused or failed to execute a signal.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("confidence {confidence:.3} below minimum {minimum:.3}")]
    BelowConfidence { confidence: f64, minimum: f64 },

    #[error("signal is HOLD")]
    Hold,

    #[error("safe-stop is active: {reason}")]
    SafeStopActive { reason: String },

    #[error("{symbol} is cooling down for {remaining_secs}s after a recent failure")]
    SymbolCoolDown {
        symbol: String,
        remaining_secs: u64,
    },

    #[error("notional cap exceeded for {scope}: {requested} > {cap}")]
    NotionalCapExceeded {
        scope: &'static str,
        requested: rust_decimal::Decimal,
        cap: rust_decimal::Decimal,
    },

    #[error("computed size {notional} is below the venue minimum {min_order}")]
    SizeBelowMinimum {
        notional: rust_decimal::Decimal,
        min_order: rust_decimal::Decimal,
    },

    #[error("intent {id} was already submitted {elapsed_ms}ms ago")]
    DuplicateSubmission { id: Uuid, elapsed_ms: u64 },

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Venue(#[from] VenueError),
}

impl ExecError {
    /// The fatal class this error belongs to, if any.
    pub fn fatal_kind(&self) -> Option<FatalKind> {
        match self {
            Self::Wal(_) => Some(FatalKind::Journal),
            Self::Venue(v) => v.fatal_kind(),
            _ => None,
        }
    }

    /// Fatal classes propagate out of the striker and stop the process.
    pub fn is_fatal(&self) -> bool {
        self.fatal_kind().is_some()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_classification() {
        assert!(VenueError::Signature("bad key".into()).is_fatal());
        assert!(VenueError::ClockDrift {
            drift_ms: 900,
            limit_ms: 500
        }
        .is_fatal());
        assert!(!VenueError::Network("reset".into()).is_fatal());
        assert!(!VenueError::RateLimited {
            retry_after_secs: 30
        }
        .is_fatal());
        assert!(!VenueError::Rejected {
            code: -2019,
            message: "margin is insufficient".into()
        }
        .is_fatal());
    }

    #[test]
    fn exec_error_fatality_follows_cause() {
        assert!(ExecError::Wal(WalError::Poisoned).is_fatal());
        assert!(ExecError::Venue(VenueError::Signature("x".into())).is_fatal());
        assert!(!ExecError::Hold.is_fatal());
        assert!(!ExecError::Venue(VenueError::Network("x".into())).is_fatal());
    }

    #[test]
    fn exit_codes_follow_process_interface() {
        assert_eq!(FatalKind::Credentials.exit_code(), 2);
        assert_eq!(FatalKind::Journal.exit_code(), 3);
        assert_eq!(FatalKind::Clock.exit_code(), 4);
        assert_eq!(
            ExecError::Wal(WalError::Poisoned).fatal_kind(),
            Some(FatalKind::Journal)
        );
        assert_eq!(
            VenueError::Signature("x".into()).fatal_kind(),
            Some(FatalKind::Credentials)
        );
    }

    #[test]
    fn messages_carry_context() {
        let e = VenueError::Rejected {
            code: -1013,
            message: "Filter failure: LOT_SIZE".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("-1013"));
        assert!(msg.contains("LOT_SIZE"));
    }
}
