//! Error type shared by the store, the reconciler and both client surfaces.
//!
//! Every failure is a [`SyncError`] carrying a stable [`ErrorCode`]. The code
//! decides the HTTP status, whether the reconciler retries, the tracing level
//! the error is logged at, and the legacy `error_code` string clients see.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Claimed version is further behind than the staleness window allows.
    VersionConflict,
    /// Store could not be reached; retried with backoff.
    StorageUnavailable,
    /// Store rejected the operation; never retried.
    StorageFailed,
    SerializationError,
    ValidationError,
    InvalidJson,
    InvalidFormat,
    ConfigurationError,
}

impl ErrorCode {
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::VersionConflict => 1000,
            Self::StorageUnavailable => 2000,
            Self::StorageFailed => 2001,
            Self::SerializationError => 2200,
            Self::ValidationError => 4100,
            Self::InvalidJson => 4101,
            Self::InvalidFormat => 4103,
            Self::ConfigurationError => 5000,
        }
    }

    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::VersionConflict => StatusCode::CONFLICT,
            Self::InvalidJson => StatusCode::BAD_REQUEST,
            Self::ValidationError | Self::InvalidFormat => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::StorageFailed
            | Self::SerializationError
            | Self::ConfigurationError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Only storage connectivity failures are retried. Validation and
    /// reconciliation failures are final for the request that caused them.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StorageUnavailable)
    }

    pub const fn category(&self) -> &'static str {
        match self {
            Self::VersionConflict => "sync",
            Self::StorageUnavailable | Self::StorageFailed => "storage",
            Self::SerializationError => "serialization",
            Self::ValidationError | Self::InvalidJson | Self::InvalidFormat => "validation",
            Self::ConfigurationError => "configuration",
        }
    }

    /// String sent as `error_code` in response envelopes and `error` events.
    pub const fn legacy_code(&self) -> &'static str {
        match self {
            Self::VersionConflict => "VERSION_CONFLICT",
            Self::StorageUnavailable | Self::StorageFailed => "STORAGE_ERROR",
            Self::SerializationError => "SERIALIZATION_ERROR",
            Self::ValidationError | Self::InvalidFormat => "VALIDATION_ERROR",
            Self::InvalidJson => "INVALID_JSON",
            Self::ConfigurationError => "CONFIG_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Drives the tracing level an error is logged at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Bad input or a stale version.
    Low,
    /// Transient storage trouble.
    Medium,
    /// Storage or configuration failure.
    High,
}

impl ErrorSeverity {
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::ValidationError
            | ErrorCode::InvalidJson
            | ErrorCode::InvalidFormat
            | ErrorCode::VersionConflict => Self::Low,
            ErrorCode::StorageUnavailable => Self::Medium,
            ErrorCode::StorageFailed
            | ErrorCode::SerializationError
            | ErrorCode::ConfigurationError => Self::High,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured extras attached to an error and echoed in `error_info.details`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Offending payload path, e.g. `lines[2].name`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.field.is_none()
            && self.retry_after_secs.is_none()
            && self.suggested_action.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SyncError
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub struct SyncError {
    code: ErrorCode,
    /// Safe to show to clients.
    user_message: Cow<'static, str>,
    /// Logged, never sent.
    internal_message: Option<String>,
    details: ErrorDetails,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl SyncError {
    /// Every construction is counted in `speedline_errors_total`.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        counter!(
            "speedline_errors_total",
            "code" => code.to_string(),
            "category" => code.category(),
            "retryable" => code.is_retryable().to_string(),
        )
        .increment(1);

        Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        }
    }

    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Validation failure at a specific payload path. The path prefixes the
    /// message and is recorded in `details.field`.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let field = field.into();
        Self::new(
            ErrorCode::ValidationError,
            format!("{}: {}", field, message.into()),
        )
        .with_details(ErrorDetails::new().with_field(field))
    }

    /// Transient storage failure.
    pub fn storage_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::StorageUnavailable,
            "Storage is temporarily unavailable",
            message,
        )
        .with_details(ErrorDetails::new().with_retry_after(1))
    }

    /// Fatal storage failure.
    pub fn storage_failed(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::StorageFailed, "Failed to persist state", message)
    }

    pub fn version_conflict(claimed: u64, current: u64) -> Self {
        Self::new(
            ErrorCode::VersionConflict,
            format!(
                "State is out of date: claimed version {}, current version {}",
                claimed, current
            ),
        )
        .with_context("claimed_version", claimed)
        .with_context("current_version", current)
        .with_details(ErrorDetails::new().with_suggestion("Refresh the state and retry"))
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Replace the details, keeping any context already recorded.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        let mut context = std::mem::take(&mut self.details.context);
        context.extend(details.context.clone());
        self.details = ErrorDetails { context, ..details };
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    pub fn error_code(&self) -> &'static str {
        self.code.legacy_code()
    }

    /// Emit this error at the level its severity calls for.
    pub fn log(&self) {
        let code = self.code.to_string();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::High => tracing::error!(
                error_code = %code,
                category = self.code.category(),
                http_status = status,
                user_message = %self.user_message,
                internal_message = ?self.internal_message,
                source = ?self.source,
                "request failed"
            ),
            ErrorSeverity::Medium => tracing::warn!(
                error_code = %code,
                http_status = status,
                internal_message = ?self.internal_message,
                "request failed on transient storage error"
            ),
            ErrorSeverity::Low => tracing::debug!(
                error_code = %code,
                http_status = status,
                user_message = %self.user_message,
                "request rejected"
            ),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error body. `success`, `error` and `error_code` line up with the success
/// envelope so clients can parse both with one type.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub error_code: String,
    pub error_info: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&SyncError> for ErrorResponse {
    fn from(error: &SyncError) -> Self {
        Self {
            success: false,
            error: error.user_message.to_string(),
            error_code: error.error_code().to_string(),
            error_info: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: (!error.details.is_empty()).then(|| error.details.clone()),
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for SyncError {
    fn into_response(self) -> Response {
        self.log();
        (self.http_status(), Json(ErrorResponse::from(&self))).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Conversions
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for SyncError {
    fn from(error: sqlx::Error) -> Self {
        let transient = match &error {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => true,
            // serialization_failure, deadlock_detected
            sqlx::Error::Database(db_err) => {
                matches!(db_err.code().as_deref(), Some("40001") | Some("40P01"))
            }
            _ => false,
        };

        if transient {
            Self::storage_unavailable(error.to_string()).with_source(error)
        } else {
            Self::storage_failed(error.to_string()).with_source(error)
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(error: serde_json::Error) -> Self {
        let (code, user_msg) = if error.is_syntax() || error.is_eof() {
            (ErrorCode::InvalidJson, "Request body is not valid JSON")
        } else if error.is_data() {
            (ErrorCode::InvalidFormat, "JSON data has an unexpected shape")
        } else {
            (ErrorCode::SerializationError, "Failed to process JSON data")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<std::io::Error> for SyncError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset => {
                Self::storage_unavailable(error.to_string()).with_source(error)
            }
            _ => Self::storage_failed(error.to_string()).with_source(error),
        }
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(error: config::ConfigError) -> Self {
        let user_msg = match &error {
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => {
                "Configuration file is invalid"
            }
            _ => "Configuration error occurred",
        };

        Self::with_internal(ErrorCode::ConfigurationError, user_msg, error.to_string())
    }
}
