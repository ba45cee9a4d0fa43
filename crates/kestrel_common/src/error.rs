//! Client error taxonomy.
//!
//! Server failures arrive as a small-integer code sequence plus a code
//! string, message, request id, status and fault. The sequence prefix drives
//! both retry classification and translation into the user-visible error
//! codes the backing database would produce for the same condition.

use std::collections::HashMap;

use kestrel_codec::{AttributeValue, CodecError};
use thiserror::Error;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

// ── User-visible error code strings ──────────────────────────────────────

pub const ERR_CODE_RESOURCE_NOT_FOUND: &str = "ResourceNotFoundException";
pub const ERR_CODE_RESOURCE_IN_USE: &str = "ResourceInUseException";
pub const ERR_CODE_PROVISIONED_THROUGHPUT_EXCEEDED: &str =
    "ProvisionedThroughputExceededException";
pub const ERR_CODE_CONDITIONAL_CHECK_FAILED: &str = "ConditionalCheckFailedException";
pub const ERR_CODE_VALIDATION: &str = "ValidationException";
pub const ERR_CODE_INTERNAL_SERVER_ERROR: &str = "InternalServerError";
pub const ERR_CODE_ITEM_COLLECTION_SIZE_LIMIT_EXCEEDED: &str =
    "ItemCollectionSizeLimitExceededException";
pub const ERR_CODE_LIMIT_EXCEEDED: &str = "LimitExceededException";
pub const ERR_CODE_THROTTLING: &str = "ThrottlingException";
pub const ERR_CODE_TRANSACTION_CONFLICT: &str = "TransactionConflictException";
pub const ERR_CODE_TRANSACTION_CANCELED: &str = "TransactionCanceledException";
pub const ERR_CODE_TRANSACTION_IN_PROGRESS: &str = "TransactionInProgressException";
pub const ERR_CODE_IDEMPOTENT_PARAMETER_MISMATCH: &str = "IdempotentParameterMismatchException";
pub const ERR_CODE_NOT_IMPLEMENTED: &str = "NotImplemented";
pub const ERR_CODE_INVALID_PARAMETER: &str = "InvalidParameter";
pub const ERR_CODE_UNKNOWN: &str = "Unknown";

/// Which side of the wire caused a server-reported failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Server,
    Client,
    Unknown,
}

/// One per-operation reason attached to a canceled transaction.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CancellationReason {
    pub code: Option<String>,
    pub message: Option<String>,
    pub item: Option<HashMap<String, AttributeValue>>,
}

/// Top-level error type surfaced by every client operation.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("invalid parameter {field}: {message}")]
    ParameterValidation { field: String, message: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("deserialization failed: {0}")]
    Deserialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation canceled: {0}")]
    Canceled(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A typed failure reported by a cache node.
    #[error("{code}: {message} (request id {request_id}, status {status})")]
    ServerRequestFailure {
        code_seq: Vec<i32>,
        code: String,
        message: String,
        request_id: String,
        status: i32,
        fault: Fault,
    },

    /// A canceled transaction, with one reason per operation.
    #[error("{code}: {message} (request id {request_id}, status {status})")]
    TransactionCanceled {
        code_seq: Vec<i32>,
        code: String,
        message: String,
        request_id: String,
        status: i32,
        fault: Fault,
        cancellation_reasons: Vec<CancellationReason>,
    },

    #[error("no routes available: {last_refresh_error}")]
    NoRoutes { last_refresh_error: String },

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("connection pool is closed")]
    PoolClosed,
}

impl From<CodecError> for KestrelError {
    fn from(e: CodecError) -> KestrelError {
        match e {
            CodecError::Serialization(m) => KestrelError::Serialization(m),
            CodecError::Deserialization(m) => KestrelError::Deserialization(m),
            CodecError::Truncated { expected, actual } => KestrelError::Deserialization(format!(
                "truncated input: need {expected} more bytes, have {actual}"
            )),
        }
    }
}

// Code-sequence prefixes that mark a failure as recoverable regardless of
// its terminal code.
const RECOVERABLE_PREFIXES: &[&[i32]] = &[&[1], &[2], &[4, 23, 31, 33]];

// Terminal codes that indicate a throttling or provisioning condition.
const THROTTLE_TERMINAL_CODES: &[i32] = &[40, 49, 50];

fn canonical_code(seq: &[i32]) -> Option<&'static str> {
    match seq {
        [4, 23, 24, ..] => Some(ERR_CODE_RESOURCE_NOT_FOUND),
        [4, 23, 35, ..] => Some(ERR_CODE_RESOURCE_IN_USE),
        [4, 37, 38, 39, 40, ..] => Some(ERR_CODE_PROVISIONED_THROUGHPUT_EXCEEDED),
        [4, 37, 38, 39, 41, ..] => Some(ERR_CODE_RESOURCE_NOT_FOUND),
        [4, 37, 38, 39, 43, ..] => Some(ERR_CODE_CONDITIONAL_CHECK_FAILED),
        [4, 37, 38, 39, 45, ..] => Some(ERR_CODE_RESOURCE_IN_USE),
        [4, 37, 38, 39, 46, ..] => Some(ERR_CODE_VALIDATION),
        [4, 37, 38, 39, 47, ..] => Some(ERR_CODE_INTERNAL_SERVER_ERROR),
        [4, 37, 38, 39, 48, ..] => Some(ERR_CODE_ITEM_COLLECTION_SIZE_LIMIT_EXCEEDED),
        [4, 37, 38, 39, 49, ..] => Some(ERR_CODE_LIMIT_EXCEEDED),
        [4, 37, 38, 39, 50, ..] => Some(ERR_CODE_THROTTLING),
        [4, 37, 38, 39, 57, ..] => Some(ERR_CODE_TRANSACTION_CONFLICT),
        [4, 37, 38, 39, 58, ..] => Some(ERR_CODE_TRANSACTION_CANCELED),
        [4, 37, 38, 39, 59, ..] => Some(ERR_CODE_TRANSACTION_IN_PROGRESS),
        [4, 37, 38, 39, 60, ..] => Some(ERR_CODE_IDEMPOTENT_PARAMETER_MISMATCH),
        [4, 37, 38, 44, ..] => Some(ERR_CODE_NOT_IMPLEMENTED),
        _ => None,
    }
}

impl KestrelError {
    /// Construct a server-reported failure.
    pub fn server_failure(
        code_seq: Vec<i32>,
        code: impl Into<String>,
        message: impl Into<String>,
        request_id: impl Into<String>,
        status: i32,
        fault: Fault,
    ) -> KestrelError {
        KestrelError::ServerRequestFailure {
            code_seq,
            code: code.into(),
            message: message.into(),
            request_id: request_id.into(),
            status,
            fault,
        }
    }

    /// Construct a parameter validation failure.
    pub fn param(field: impl Into<String>, message: impl Into<String>) -> KestrelError {
        KestrelError::ParameterValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The server code sequence, when this is a server-reported failure.
    pub fn code_sequence(&self) -> Option<&[i32]> {
        match self {
            KestrelError::ServerRequestFailure { code_seq, .. }
            | KestrelError::TransactionCanceled { code_seq, .. } => Some(code_seq),
            _ => None,
        }
    }

    /// The user-visible error code string, when one applies.
    pub fn code(&self) -> Option<&str> {
        match self {
            KestrelError::ServerRequestFailure { code, .. }
            | KestrelError::TransactionCanceled { code, .. } => Some(code),
            _ => None,
        }
    }

    /// Whether the failure indicates a throttling or provisioning condition.
    pub fn is_throttle(&self) -> bool {
        match self {
            KestrelError::ServerRequestFailure { code_seq, code, .. }
            | KestrelError::TransactionCanceled { code_seq, code, .. } => {
                if matches!(
                    code.as_str(),
                    ERR_CODE_THROTTLING
                        | ERR_CODE_PROVISIONED_THROUGHPUT_EXCEEDED
                        | ERR_CODE_LIMIT_EXCEEDED
                ) {
                    return true;
                }
                code_seq
                    .last()
                    .is_some_and(|c| THROTTLE_TERMINAL_CODES.contains(c))
            }
            _ => false,
        }
    }

    /// Whether a retry on another route may succeed.
    pub fn is_retryable(&self) -> bool {
        let Some(seq) = self.code_sequence() else {
            return false;
        };
        if seq.first() == Some(&0) {
            return false;
        }
        if RECOVERABLE_PREFIXES.iter().any(|p| seq.starts_with(p)) {
            return true;
        }
        self.is_throttle()
    }

    /// Whether the failure indicates the cached connection credentials were
    /// rejected and the next use must re-authenticate.
    pub fn auth_error(&self) -> bool {
        self.code_sequence()
            .is_some_and(|seq| seq.starts_with(&[4, 23, 31, 33]))
    }

    /// Whether this is an I/O-shaped failure (network or deadline) for
    /// health accounting.
    pub fn is_io_error(&self) -> bool {
        matches!(self, KestrelError::Io(_) | KestrelError::DeadlineExceeded)
    }

    /// Whether the operation was canceled or timed out.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            KestrelError::Canceled(_) | KestrelError::DeadlineExceeded
        )
    }

    /// Produce an owned copy of this error. `Io` sources are rebuilt from
    /// their kind and message, everything else clones field-for-field. Used
    /// where one failure fans out to several waiters.
    pub fn duplicate(&self) -> KestrelError {
        match self {
            KestrelError::ParameterValidation { field, message } => {
                KestrelError::ParameterValidation { field: field.clone(), message: message.clone() }
            }
            KestrelError::Serialization(m) => KestrelError::Serialization(m.clone()),
            KestrelError::Deserialization(m) => KestrelError::Deserialization(m.clone()),
            KestrelError::Io(e) => {
                KestrelError::Io(std::io::Error::new(e.kind(), e.to_string()))
            }
            KestrelError::Canceled(m) => KestrelError::Canceled(m.clone()),
            KestrelError::DeadlineExceeded => KestrelError::DeadlineExceeded,
            KestrelError::ServerRequestFailure { code_seq, code, message, request_id, status, fault } => {
                KestrelError::ServerRequestFailure {
                    code_seq: code_seq.clone(),
                    code: code.clone(),
                    message: message.clone(),
                    request_id: request_id.clone(),
                    status: *status,
                    fault: *fault,
                }
            }
            KestrelError::TransactionCanceled {
                code_seq,
                code,
                message,
                request_id,
                status,
                fault,
                cancellation_reasons,
            } => KestrelError::TransactionCanceled {
                code_seq: code_seq.clone(),
                code: code.clone(),
                message: message.clone(),
                request_id: request_id.clone(),
                status: *status,
                fault: *fault,
                cancellation_reasons: cancellation_reasons.clone(),
            },
            KestrelError::NoRoutes { last_refresh_error } => {
                KestrelError::NoRoutes { last_refresh_error: last_refresh_error.clone() }
            }
            KestrelError::AuthFailure(m) => KestrelError::AuthFailure(m.clone()),
            KestrelError::PoolClosed => KestrelError::PoolClosed,
        }
    }

    /// Canonicalize a server failure's code string from its code-sequence
    /// prefix. Unrecognized sequences keep their original code and message.
    pub fn translate(self) -> KestrelError {
        match self {
            KestrelError::ServerRequestFailure {
                code_seq,
                code,
                message,
                request_id,
                status,
                fault,
            } => {
                let code = canonical_code(&code_seq).map(String::from).unwrap_or(code);
                KestrelError::ServerRequestFailure {
                    code_seq,
                    code,
                    message,
                    request_id,
                    status,
                    fault,
                }
            }
            KestrelError::TransactionCanceled {
                code_seq,
                code,
                message,
                request_id,
                status,
                fault,
                cancellation_reasons,
            } => {
                let code = canonical_code(&code_seq).map(String::from).unwrap_or(code);
                KestrelError::TransactionCanceled {
                    code_seq,
                    code,
                    message,
                    request_id,
                    status,
                    fault,
                    cancellation_reasons,
                }
            }
            other => other,
        }
    }
}
