use std::collections::BTreeMap;
use std::future::Future;

use crate::Result;

/// A numeric security identity resolved to its label set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: u32,
    pub labels: BTreeMap<String, String>,
}

/// Read side of the identity store the embedding agent maintains.
///
/// Lookups may legitimately miss while the store is still being populated;
/// the manager retries them with backoff.
pub trait IdentityResolver {
    /// Blocks until the initial global identity snapshot has been populated.
    fn wait_for_initial_identities(&self) -> impl Future<Output = Result<()>> + Send;

    /// Looks up an identity by its numeric id.
    fn lookup_by_id(&self, id: u32) -> impl Future<Output = Option<Identity>> + Send;
}
