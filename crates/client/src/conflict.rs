//! Conflict resolution for failed push operations.
//!
//! A 409/412 response keeps the operation queued and hands the server's
//! authoritative entity back in the push result. Embedders settle such
//! conflicts with a [`ConflictResolver`], either one of the stock
//! policies here or their own merge logic.

use serde_json::Value;

/// The outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Replay the local mutation armed with the server's current version
    /// token; the next push wins the optimistic-concurrency check.
    ClientWins,
    /// Accept the server entity into the local store and drop the queued
    /// operation.
    ServerWins,
    /// Leave the operation queued for manual handling.
    Unresolved,
}

/// Decides how a conflicted operation is settled.
///
/// `local` is the queued operation's payload (absent for deletes);
/// `server` is the authoritative entity from the conflict response.
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: Option<&Value>, server: Option<&Value>) -> ConflictResolution;
}

/// The local mutation always wins.
pub struct ClientWinsResolver;

impl ConflictResolver for ClientWinsResolver {
    fn resolve(&self, _local: Option<&Value>, _server: Option<&Value>) -> ConflictResolution {
        ConflictResolution::ClientWins
    }
}

/// The server entity always wins.
pub struct ServerWinsResolver;

impl ConflictResolver for ServerWinsResolver {
    fn resolve(&self, _local: Option<&Value>, _server: Option<&Value>) -> ConflictResolution {
        ConflictResolution::ServerWins
    }
}
