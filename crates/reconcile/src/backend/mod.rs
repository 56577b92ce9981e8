//! Backend abstraction for the remote entity API.
//!
//! The [`Backend`] trait is the only seam between reconciliation logic and
//! the wire, allowing for different implementations (real HTTP, in-memory
//! fakes for testing).

pub mod http;

use crate::error::Result;
use crate::query::SearchQuery;
use crate::types::Endpoint;
use serde_json::Value;

/// Backend trait for remote entity operations.
///
/// Every call is synchronous. Errors carry the HTTP status and raw payload
/// so callers can classify them.
pub trait Backend {
    /// Search a collection. Returns the `results` array of the response.
    fn search(&self, endpoint: &Endpoint, query: &SearchQuery) -> Result<Vec<Value>>;

    /// Create a member of a collection.
    fn create(&self, endpoint: &Endpoint, body: &Value) -> Result<Value>;

    /// Update the member `id` of a collection.
    fn update(&self, endpoint: &Endpoint, id: &str, body: &Value) -> Result<Value>;
}
