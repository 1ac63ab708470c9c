//! Key validation for statelog
//!
//! Every structure instance is identified by a string key that is unique
//! within its host. Keys are validated once, at construction, and are
//! cheap to clone afterwards.
//!
//! ## Contract
//!
//! - Keys must not be empty
//! - Keys must not contain NUL bytes (`\0`)

use crate::error::{JournalError, Result};
use std::fmt;
use std::sync::Arc;

/// A validated, cheaply-clonable structure key.
///
/// # Examples
///
/// ```
/// use statelog_core::StateKey;
///
/// let key = StateKey::new("cart").unwrap();
/// assert_eq!(key.as_str(), "cart");
///
/// assert!(StateKey::new("").is_err());
/// assert!(StateKey::new("a\0b").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey(Arc<str>);

impl StateKey {
    /// Validate and construct a key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` when the key is empty or contains a NUL
    /// byte.
    pub fn new(key: impl AsRef<str>) -> Result<Self> {
        let key = key.as_ref();
        if key.is_empty() {
            return Err(JournalError::invalid_argument("key cannot be empty"));
        }
        if key.contains('\0') {
            return Err(JournalError::invalid_argument(
                "key cannot contain NUL bytes",
            ));
        }
        Ok(StateKey(Arc::from(key)))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for StateKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_keys() {
        assert!(StateKey::new("cart").is_ok());
        assert!(StateKey::new("user:123").is_ok());
        assert!(StateKey::new("日本語").is_ok());
    }

    #[test]
    fn test_empty_key_rejected() {
        let err = StateKey::new("").unwrap_err();
        assert!(matches!(err, JournalError::InvalidArgument { .. }));
    }

    #[test]
    fn test_nul_rejected() {
        assert!(StateKey::new("a\0b").is_err());
    }

    #[test]
    fn test_clone_and_display() {
        let key = StateKey::new("orders").unwrap();
        let copy = key.clone();
        assert_eq!(key, copy);
        assert_eq!(format!("{}", key), "orders");
    }
}
