#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod cancel;
pub mod capabilities;
pub mod config;
pub mod model;
pub mod observer;
pub mod queue;
pub mod resync;
pub mod service;
pub mod session;
pub mod submission;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use capabilities::{HttpError, KvError};
use config::ConfigError;
use queue::QueueError;
use session::SessionError;
use submission::SubmissionError;

pub use app::App;
#[cfg(not(target_arch = "wasm32"))]
pub use app::NativeApp;
pub use cancel::CancellationToken;
pub use config::CoreConfig;
pub use model::{
    Coordinates, EvidenceUri, IncidentInfo, LocationInfo, PersonalInfo, QueueEntryId,
    QueuedReport, Report, UnixTimeMs, UserId,
};
pub use observer::NetworkObserver;
pub use queue::ReportQueue;
pub use resync::{
    ClearPolicy, FailurePolicy, MetricsSnapshot, PassOutcome, ResyncOptions, ResyncOrchestrator,
    ResyncTrigger,
};
pub use service::{ReportService, SubmissionOutcome};
pub use session::{Credentials, Session, SessionStore};
pub use submission::ReportSubmissionClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Authentication,
    Authorization,
    Validation,
    NotFound,
    Conflict,
    RateLimited,
    QuotaExceeded,
    Storage,
    Serialization,
    Deserialization,
    Attachment,
    InvalidState,
    Internal,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Authentication => "AUTH_ERROR",
            Self::Authorization => "FORBIDDEN",
            Self::Validation => "VALIDATION_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::RateLimited => "RATE_LIMITED",
            Self::QuotaExceeded => "QUOTA_EXCEEDED",
            Self::Storage => "STORAGE_ERROR",
            Self::Serialization => "SERIALIZATION_ERROR",
            Self::Deserialization => "DESERIALIZATION_ERROR",
            Self::Attachment => "ATTACHMENT_ERROR",
            Self::InvalidState => "INVALID_STATE",
            Self::Internal => "INTERNAL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Network | Self::Timeout | Self::Conflict | Self::RateLimited | Self::Storage => {
                ErrorSeverity::Transient
            }

            Self::Serialization | Self::Deserialization | Self::Internal | Self::InvalidState => {
                ErrorSeverity::Fatal
            }

            Self::Authentication
            | Self::Authorization
            | Self::Validation
            | Self::NotFound
            | Self::QuotaExceeded
            | Self::Attachment
            | Self::Unknown => ErrorSeverity::Permanent,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network | Self::Timeout | Self::RateLimited | Self::Storage | Self::Conflict
        )
    }
}

/// Error surfaced to the shell, e.g. for the alert after a failed online submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub internal_message: Option<String>,
    pub retry_after_ms: Option<u64>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            internal_message: None,
            retry_after_ms: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_retry_after(mut self, ms: u64) -> Self {
        self.retry_after_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to connect. Please check your internet connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Authentication => "Your session has expired. Please sign in again.".into(),
            ErrorKind::Authorization => "You don't have permission to perform this action.".into(),
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::NotFound => "The requested item could not be found.".into(),
            ErrorKind::Conflict => {
                "This report conflicts with a recent change. Please try again.".into()
            }
            ErrorKind::RateLimited => match self.retry_after_ms {
                Some(retry_after) => format!(
                    "Too many requests. Please wait {} seconds and try again.",
                    retry_after / 1000
                ),
                None => "Too many requests. Please wait a moment and try again.".into(),
            },
            ErrorKind::QuotaExceeded => {
                "Too many reports are waiting to be sent. Connect to the internet to send them."
                    .into()
            }
            ErrorKind::Storage => {
                "Unable to save the report on this device. Please free up some storage space."
                    .into()
            }
            ErrorKind::Serialization | ErrorKind::Deserialization => {
                "A data error occurred. Please contact support if this persists.".into()
            }
            ErrorKind::Attachment => {
                "One of the attached photos could not be read. Please attach it again.".into()
            }
            ErrorKind::InvalidState => {
                "The app is in an invalid state. Please restart the app.".into()
            }
            ErrorKind::Internal | ErrorKind::Unknown => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }

    #[must_use]
    pub fn from_http_status(status: u16, body: Option<&[u8]>) -> Self {
        let kind = match status {
            400 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Authentication,
            403 => ErrorKind::Authorization,
            404 => ErrorKind::NotFound,
            409 => ErrorKind::Conflict,
            429 => ErrorKind::RateLimited,
            402 => ErrorKind::QuotaExceeded,
            408 => ErrorKind::Timeout,
            500..=599 => ErrorKind::Internal,
            _ => ErrorKind::Unknown,
        };

        let message = body
            .and_then(|b| serde_json::from_slice::<ApiErrorResponse>(b).ok())
            .map(|e| e.message)
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("HTTP error: {status}"));

        Self::new(kind, message).with_context("http_status", status.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    message: String,
}

pub type AppResult<T> = Result<T, AppError>;

impl From<HttpError> for AppError {
    fn from(e: HttpError) -> Self {
        let error = match &e {
            HttpError::HttpStatus {
                status, message, ..
            } => AppError::from_http_status(*status, Some(message.as_bytes()))
                .with_internal(message.clone()),
            HttpError::Timeout { timeout_ms, .. } => {
                AppError::new(ErrorKind::Timeout, format!("no response after {timeout_ms}ms"))
            }
            HttpError::ConnectionError { .. } => {
                AppError::new(ErrorKind::Network, "could not reach the server")
                    .with_internal(e.to_string())
            }
            HttpError::Attachment { .. } => {
                AppError::new(ErrorKind::Attachment, e.to_string())
            }
            HttpError::InvalidResponse { .. } => {
                AppError::new(ErrorKind::Deserialization, e.to_string())
            }
            HttpError::SerializationError { .. } => {
                AppError::new(ErrorKind::Serialization, e.to_string())
            }
            HttpError::InvalidUrl { .. }
            | HttpError::InvalidHeader { .. }
            | HttpError::TooManyHeaders { .. }
            | HttpError::BodyTooLarge { .. }
            | HttpError::ResponseTooLarge { .. }
            | HttpError::InvalidRequest { .. } => AppError::new(ErrorKind::Internal, e.to_string()),
        };
        match e.request_id() {
            Some(request_id) => error.with_context("request_id", request_id),
            None => error,
        }
    }
}

impl From<SubmissionError> for AppError {
    fn from(e: SubmissionError) -> Self {
        match e {
            SubmissionError::Http(http) => http.into(),
            SubmissionError::MalformedResponse { status, .. } => {
                AppError::new(ErrorKind::Deserialization, e.to_string())
                    .with_context("http_status", status.to_string())
            }
            SubmissionError::Encoding { .. } => {
                AppError::new(ErrorKind::Serialization, e.to_string())
            }
        }
    }
}

impl From<KvError> for AppError {
    fn from(e: KvError) -> Self {
        match e {
            KvError::InvalidKey { .. } => AppError::new(ErrorKind::Internal, e.to_string()),
            KvError::ValueTooLarge { .. } | KvError::Storage { .. } => {
                AppError::new(ErrorKind::Storage, e.to_string())
            }
            KvError::Serialization { .. } => {
                AppError::new(ErrorKind::Deserialization, e.to_string())
            }
        }
    }
}

impl From<QueueError> for AppError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Full(len) => {
                AppError::new(ErrorKind::QuotaExceeded, format!("{len} reports already queued"))
            }
            QueueError::Storage(kv) => kv.into(),
            QueueError::Corrupted(_) => AppError::new(ErrorKind::Deserialization, e.to_string()),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::EmptyUserId | SessionError::EmptyToken => {
                AppError::new(ErrorKind::Validation, e.to_string())
            }
            SessionError::Storage(kv) => kv.into(),
        }
    }
}
