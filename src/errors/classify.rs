//! Retryable/fatal classification of operation errors.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

/// An error type that can report its kind.
///
/// Kinds let a retry executor or circuit breaker be configured with a set of
/// error kinds to react to, instead of a hand-written predicate.
pub trait ErrorKind {
    /// The kind discriminant.
    type Kind: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Returns the kind of this error.
    fn kind(&self) -> Self::Kind;
}

/// An error type that knows whether it is transient.
pub trait Retryable {
    /// Returns true if the failed call may succeed when attempted again.
    fn is_retryable(&self) -> bool;
}

/// Predicate deciding whether an error belongs to a class.
///
/// Used as the `retryable_errors` set of a [`RetryExecutor`](crate::resilience::RetryExecutor)
/// and the `expected_error` of a [`CircuitBreaker`](crate::resilience::CircuitBreaker).
pub struct ErrorClassifier<E> {
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
    description: String,
}

impl<E> ErrorClassifier<E> {
    /// Creates a classifier from a predicate.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Self {
            predicate: Arc::new(predicate),
            description: "custom".to_string(),
        }
    }

    /// Matches every error.
    pub fn any() -> Self
    where
        E: 'static,
    {
        Self {
            predicate: Arc::new(|_: &E| true),
            description: "any".to_string(),
        }
    }

    /// Matches no error.
    pub fn none() -> Self
    where
        E: 'static,
    {
        Self {
            predicate: Arc::new(|_: &E| false),
            description: "none".to_string(),
        }
    }

    /// Returns true if `error` belongs to this class.
    pub fn matches(&self, error: &E) -> bool {
        (self.predicate)(error)
    }
}

impl<E: Retryable + 'static> ErrorClassifier<E> {
    /// Matches errors whose [`Retryable::is_retryable`] returns true.
    pub fn retryable() -> Self {
        Self {
            predicate: Arc::new(|e: &E| e.is_retryable()),
            description: "retryable".to_string(),
        }
    }
}

impl<E: ErrorKind + 'static> ErrorClassifier<E> {
    /// Matches errors whose kind is in `kinds`.
    pub fn kinds<I>(kinds: I) -> Self
    where
        I: IntoIterator<Item = E::Kind>,
    {
        let kinds: HashSet<E::Kind> = kinds.into_iter().collect();
        let description = format!("kinds {:?}", kinds);
        Self {
            predicate: Arc::new(move |e: &E| kinds.contains(&e.kind())),
            description,
        }
    }
}

impl<E> Clone for ErrorClassifier<E> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
            description: self.description.clone(),
        }
    }
}

impl<E> fmt::Debug for ErrorClassifier<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorClassifier")
            .field("matches", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ServiceError, ServiceErrorKind};

    #[test]
    fn test_any_and_none() {
        let err = ServiceError::validation("bad card number");
        assert!(ErrorClassifier::<ServiceError>::any().matches(&err));
        assert!(!ErrorClassifier::<ServiceError>::none().matches(&err));
    }

    #[test]
    fn test_retryable_classifier() {
        let classifier = ErrorClassifier::<ServiceError>::retryable();
        assert!(classifier.matches(&ServiceError::timeout("slow gateway")));
        assert!(!classifier.matches(&ServiceError::business_rule("card declined")));
    }

    #[test]
    fn test_kinds_classifier() {
        let classifier = ErrorClassifier::<ServiceError>::kinds([
            ServiceErrorKind::Network,
            ServiceErrorKind::Unavailable,
        ]);
        assert!(classifier.matches(&ServiceError::network("reset by peer")));
        assert!(!classifier.matches(&ServiceError::timeout("slow")));
        assert!(format!("{:?}", classifier).contains("Network"));
    }

    #[test]
    fn test_custom_predicate_is_shared_by_clones() {
        let classifier = ErrorClassifier::new(|e: &ServiceError| e.to_string().contains("503"));
        let clone = classifier.clone();
        let err = ServiceError::from_status(503, "upstream 503");
        assert!(classifier.matches(&err));
        assert!(clone.matches(&err));
    }
}
