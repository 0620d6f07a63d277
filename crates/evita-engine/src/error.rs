//! Engine error taxonomy.
//!
//! Failures that reach the caller as errors:
//!
//! - **configuration** problems detected while a plan is being built
//!   (unsupported predicate mode, duplicate ordering on one scope, malformed
//!   gap expressions, invalid options),
//! - **premise violations**, i.e. a broken internal contract such as using a
//!   comparator before it was initialized,
//! - **fetch** failures reported by the entity storage.
//!
//! Cache misses, stale transactional identities and ratio overflow are not
//! errors; they only influence performance.

use evita_common::{ExprError, FixedPointError};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("internal error (premise violated): {0}")]
    PremiseViolation(String),
    #[error("entity fetch failed: {0}")]
    Fetch(String),
}

impl EngineError {
    pub fn configuration(message: impl Into<String>) -> Self {
        EngineError::Configuration(message.into())
    }

    pub fn premise(message: impl Into<String>) -> Self {
        EngineError::PremiseViolation(message.into())
    }
}

impl From<ExprError> for EngineError {
    fn from(err: ExprError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

impl From<FixedPointError> for EngineError {
    fn from(err: FixedPointError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
