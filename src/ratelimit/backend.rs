//! Window backend trait for abstracting the counting store.

use async_trait::async_trait;

use super::identity::IdentityKey;
use crate::error::StoreError;

/// Trait for window store implementations.
///
/// The limiter only talks to this trait, so a store that reports an error
/// instead of a count goes through the limiter's failure mode rather than
/// aborting the request.
#[async_trait]
pub trait WindowBackend: Send + Sync {
    /// Record one request for `key` and return the number of requests in the
    /// current window, including this one.
    async fn increment(&self, key: &IdentityKey) -> Result<u64, StoreError>;

    /// Forget every request recorded for `key`.
    async fn reset(&self, key: &IdentityKey) -> Result<(), StoreError>;

    /// Live counts per key, for diagnostics only.
    fn snapshot(&self) -> Vec<(IdentityKey, u64)>;
}
