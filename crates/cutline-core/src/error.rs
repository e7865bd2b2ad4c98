// crates/cutline-core/src/error.rs
//
// Decode error taxonomy. Recoverable kinds are consumed inside the decoder
// and turn into bookkeeping (failure counts, quarantines, proxy triggers);
// only Cancelled and final unrecoverable failures surface to the pipeline.

use thiserror::Error;

/// Bad-data code reported by the reference platform's decoder for corrupted
/// or unusable samples. Carried verbatim so logs line up across ports.
pub const BAD_DATA_CODE: i32 = -12785;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Corrupted/unusable sample; recoverable via anchor swap or proxy.
    #[error("bad data in stream (code {code})")]
    BadData { code: i32 },

    /// Decoder session needs a rebuild before it can accept more work.
    #[error("decoder session invalid")]
    SessionInvalid,

    /// Stream format the active backend cannot decode; escalate immediately.
    #[error("unsupported format")]
    UnsupportedFormat,

    /// Decoder malfunction; escalate straight to the software rung.
    #[error("decoder malfunction")]
    Malfunction,

    /// No random-access point found near the requested time.
    #[error("no random-access point near {near_ms}ms")]
    IndexMiss { near_ms: i64 },

    /// Reader could not be configured or started.
    #[error("reader configuration failed: {0}")]
    ReaderConfig(String),

    /// Watchdog fired; treated as a cancellation that advances the reverse
    /// failure streak.
    #[error("decode timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    /// User-initiated or internal swap; silent, no streak.
    #[error("cancelled")]
    Cancelled,

    /// Disk-cache I/O; cache-local, logged, never user-visible.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    pub fn bad_data() -> Self {
        DecodeError::BadData { code: BAD_DATA_CODE }
    }

    pub fn is_bad_data(&self) -> bool {
        matches!(self, DecodeError::BadData { .. })
    }

    /// Recoverable errors stay inside the decoder actor.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DecodeError::Cancelled)
    }

    /// Whether this failure advances the reverse failure streak counters.
    /// Cancellation is silent; everything else counts.
    pub fn advances_failure_streak(&self) -> bool {
        !matches!(self, DecodeError::Cancelled | DecodeError::Io(_))
    }

    /// Immediate ladder escalation, skipping the error-rate window.
    pub fn escalates_immediately(&self) -> bool {
        matches!(self, DecodeError::UnsupportedFormat | DecodeError::Malfunction)
    }

    /// Stable tag for telemetry and log lines.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            DecodeError::BadData { .. } => "bad_data",
            DecodeError::SessionInvalid => "session_invalid",
            DecodeError::UnsupportedFormat => "unsupported_format",
            DecodeError::Malfunction => "malfunction",
            DecodeError::IndexMiss { .. } => "index_miss",
            DecodeError::ReaderConfig(_) => "reader_config",
            DecodeError::Timeout { .. } => "timeout",
            DecodeError::Cancelled => "cancelled",
            DecodeError::Io(_) => "io",
        }
    }
}
