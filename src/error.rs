//! Error types shared by every lifecycle operation.

use thiserror::Error;
use uuid::Uuid;

/// A single field-level validation failure.
///
/// `field` is `None` for failures that concern the input as a whole
/// rather than one field (e.g. "at least one filter is required").
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FieldError {
    pub field: Option<&'static str>,
    pub message: &'static str,
}

/// Collector for validation failures, turned into [`Error::Validation`]
/// once all checks on an input have run.
#[derive(Debug, Default)]
pub(crate) struct FieldErrors(Vec<FieldError>);

impl FieldErrors {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, field: &'static str, message: &'static str) {
        self.0.push(FieldError {
            field: Some(field),
            message,
        });
    }

    pub(crate) fn general(&mut self, message: &'static str) {
        self.0.push(FieldError {
            field: None,
            message,
        });
    }

    /// Require a non-empty value, recording "Required." otherwise.
    pub(crate) fn require(&mut self, field: &'static str, value: &str) {
        if value.is_empty() {
            self.push(field, "Required.");
        }
    }

    /// Parse an id, recording "Invalid id." on malformed input so the
    /// operation fails fast before touching storage.
    pub(crate) fn parse_uuid(&mut self, field: &'static str, value: &str) -> Option<Uuid> {
        match Uuid::parse_str(value) {
            Ok(id) => Some(id),
            Err(_) => {
                self.push(field, "Invalid id.");
                None
            }
        }
    }

    /// Require a well-formed id: records "Required." on empty input and
    /// "Invalid id." on malformed input.
    pub(crate) fn require_uuid(&mut self, field: &'static str, value: &str) -> Option<Uuid> {
        if value.is_empty() {
            self.push(field, "Required.");
            return None;
        }
        self.parse_uuid(field, value)
    }

    pub(crate) fn into_result(self) -> Result<(), Error> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self.0))
        }
    }
}

/// Every outcome a lifecycle operation can produce besides success.
///
/// All variants except [`Error::Internal`] are expected, user-facing
/// outcomes. Credential rejections are deliberately coarse: a missing
/// account and a wrong password are indistinguishable, and a missing,
/// wrong-kind, or expired token all surface as [`Error::InvalidToken`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation failed")]
    Validation(Vec<FieldError>),
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("invalid password")]
    InvalidPassword,
    #[error("invalid token")]
    InvalidToken,
    #[error("unauthorized")]
    Unauthorized,
    #[error("account banned")]
    AccountBanned,
    #[error("reached session limit")]
    SessionLimitReached,
    #[error("session not found")]
    SessionNotFound,
    #[error("account not found")]
    AccountNotFound,
    #[error("ban not found")]
    BanNotFound,
    #[error("ban already exists")]
    BanAlreadyExists,
    #[error("account already verified")]
    AlreadyVerified,
    #[error("try again later")]
    TryLater,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Whether this is a user-facing outcome rather than an internal
    /// failure. Expected outcomes are never logged as errors; anything
    /// else is propagated with the transaction rolled back.
    #[must_use]
    pub fn is_expected(&self) -> bool {
        !matches!(self, Self::Internal(_))
    }

    /// Field errors carried by a validation failure, if any.
    #[must_use]
    pub fn field_errors(&self) -> Option<&[FieldError]> {
        match self {
            Self::Validation(errs) => Some(errs),
            _ => None,
        }
    }
}
