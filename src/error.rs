use std::fmt;

/// Why a data or heartbeat payload could not be decoded into something the worker can use.
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("invalid JSON payload: {0}")]
    Json(#[from] simd_json::Error),
    #[error("payload has {timestamps} timestamps but {rows} value rows")]
    RowCount { timestamps: usize, rows: usize },
    #[error("value row {row} has {len} entries but {channels} channels")]
    ColumnCount { row: usize, len: usize, channels: usize },
    #[error("timestamp {0} is not a valid epoch millisecond value")]
    Timestamp(f64),
}

/// Failure classes that are handled locally by writing a dead letter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    MalformedPayload,
    UnknownSensor,
    InactiveBinding,
    PersistenceFailure,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MalformedPayload => "malformed_payload",
            Self::UnknownSensor => "unknown_sensor",
            Self::InactiveBinding => "inactive_binding",
            Self::PersistenceFailure => "persistence_failure",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
