use thiserror::Error;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("counter contention not resolved after {attempts} attempts")]
    Contention { attempts: u32 },
    #[error("persistence unavailable: {0}")]
    Persistence(String),
    /// A write that lost a race inside the store and was rolled back.
    #[error("transient store failure: {0}")]
    Transient(String),
}

impl DomainError {
    /// Contention, rolled-back writes and storage outages clear up on their
    /// own; everything else needs a different request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Contention { .. } | Self::Persistence(_) | Self::Transient(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_side_failures_are_retryable() {
        assert!(DomainError::Contention { attempts: 3 }.is_retryable());
        assert!(DomainError::Persistence("down".into()).is_retryable());
        assert!(DomainError::Transient("write conflict".into()).is_retryable());
        assert!(!DomainError::Conflict.is_retryable());
        assert!(!DomainError::Validation("bad".into()).is_retryable());
    }
}
