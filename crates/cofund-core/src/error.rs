use thiserror::Error;

/// Cofund engine errors.
#[derive(Debug, Error)]
pub enum CofundError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Capacity exhausted: {0}")]
    Capacity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Payment processing failed: {message}")]
    PaymentProcessing {
        message: String,
        remaining_attempts: Option<u32>,
    },

    /// The gateway did not answer in time. The payment outcome is unknown.
    #[error("Payment gateway timed out during '{0}'")]
    UpstreamTimeout(String),

    #[error("Webhook signature rejected: {0}")]
    SignatureInvalid(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification used by transport layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Caller must change the request; never retried automatically.
    Client,
    /// Caller may retry later with the same request.
    RetryLater,
    /// Server-side fault.
    Server,
}

impl CofundError {
    pub fn declined(message: impl Into<String>, remaining_attempts: Option<u32>) -> Self {
        Self::PaymentProcessing {
            message: message.into(),
            remaining_attempts,
        }
    }

    pub fn gateway(message: impl Into<String>) -> Self {
        Self::PaymentProcessing {
            message: message.into(),
            remaining_attempts: None,
        }
    }

    /// True when the outcome of an outbound payment call is unknown.
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, Self::UpstreamTimeout(_))
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_)
            | Self::Conflict(_)
            | Self::NotFound(_)
            | Self::Unauthorized(_)
            | Self::Forbidden(_)
            | Self::PaymentProcessing { .. }
            | Self::SignatureInvalid(_) => ErrorClass::Client,
            Self::Capacity(_) | Self::UpstreamTimeout(_) => ErrorClass::RetryLater,
            Self::Persistence(_) | Self::Serialization(_) => ErrorClass::Server,
        }
    }
}

impl From<serde_json::Error> for CofundError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_indeterminate_and_retryable() {
        let err = CofundError::UpstreamTimeout("confirm_intent".to_string());
        assert!(err.is_indeterminate());
        assert_eq!(err.class(), ErrorClass::RetryLater);

        let declined = CofundError::declined("card declined", Some(2));
        assert!(!declined.is_indeterminate());
        assert_eq!(declined.class(), ErrorClass::Client);
    }
}
