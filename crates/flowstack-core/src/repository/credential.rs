//! Credential supplier trait.
//!
//! Given a user id, returns a flat map of already-decrypted credentials that
//! the engine injects into `variables.credential` before a run starts. How
//! credentials are stored or decrypted is opaque to the engine.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use flowstack_types::error::RepositoryError;
use serde_json::Value;
use uuid::Uuid;

/// Supplies decrypted credentials for a user.
pub trait CredentialSupplier: Send + Sync {
    /// Flat alias -> value map for the given user.
    fn credentials_for<'a>(
        &'a self,
        user_id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, RepositoryError>> + Send + 'a>>;
}

/// Supplier that always returns an empty map. Used by tests and deployments
/// where modules carry their own credentials.
pub struct NoCredentials;

impl CredentialSupplier for NoCredentials {
    fn credentials_for<'a>(
        &'a self,
        _user_id: &'a Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<HashMap<String, Value>, RepositoryError>> + Send + 'a>>
    {
        Box::pin(async { Ok(HashMap::new()) })
    }
}
