use std::time::Duration;

use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

/// Failures of inventory and booking-store maintenance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Outcome taxonomy of availability checks and booking admission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("invalid quantity: {0}")]
    InvalidQuantity(String),
    #[error("product not found: {0}")]
    ProductNotFound(Ulid),
    #[error("customer not found: {0}")]
    CustomerNotFound(Ulid),
    #[error("not available: requested {requested}, remaining {remaining}")]
    NotAvailable { requested: u32, remaining: u32 },
    #[error("transient conflict: gave up after {attempts} attempts")]
    TransientConflict { attempts: u32 },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("storage error: {0}")]
    Storage(String),
}

impl AdmissionError {
    /// Safe to retry the whole request later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdmissionError::TransientConflict { .. } | AdmissionError::Timeout(_)
        )
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::InvalidRange(_) => "invalid_range",
            AdmissionError::InvalidQuantity(_) => "invalid_quantity",
            AdmissionError::ProductNotFound(_) => "product_not_found",
            AdmissionError::CustomerNotFound(_) => "customer_not_found",
            AdmissionError::NotAvailable { .. } => "not_available",
            AdmissionError::TransientConflict { .. } => "transient_conflict",
            AdmissionError::Timeout(_) => "timeout",
            AdmissionError::LimitExceeded(_) => "limit_exceeded",
            AdmissionError::Storage(_) => "storage",
        }
    }
}

impl From<EngineError> for AdmissionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::LimitExceeded(what) => AdmissionError::LimitExceeded(what),
            EngineError::WalError(msg) => AdmissionError::Storage(msg),
            other => AdmissionError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(AdmissionError::TransientConflict { attempts: 5 }.is_transient());
        assert!(AdmissionError::Timeout(Duration::from_millis(10)).is_transient());
        assert!(!AdmissionError::NotAvailable { requested: 2, remaining: 1 }.is_transient());
        assert!(!AdmissionError::InvalidRange("x".into()).is_transient());
    }

    #[test]
    fn messages_name_the_kind() {
        let e = AdmissionError::NotAvailable { requested: 2, remaining: 1 };
        assert_eq!(e.to_string(), "not available: requested 2, remaining 1");
        let e = EngineError::InvalidTransition {
            from: BookingStatus::Completed,
            to: BookingStatus::Cancelled,
        };
        assert_eq!(e.to_string(), "invalid transition: completed -> cancelled");
    }

    #[test]
    fn wal_failures_surface_as_storage() {
        let e: AdmissionError = EngineError::WalError("disk full".into()).into();
        assert_eq!(e, AdmissionError::Storage("disk full".into()));
        assert_eq!(e.kind(), "storage");
    }
}
