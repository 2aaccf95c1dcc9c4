//! Pre-launch policy hook

use crate::prepared::PreparedChildProcess;
use crate::Result;

/// Policy gate consulted before uid/gid enforcement.
///
/// Returning `Ok(true)` accepts the request outright; `Ok(false)`
/// defers to [`crate::SpawnConfig::verify`].  An error rejects the
/// spawn, which the server reports like any other spawn failure.
pub trait SpawnHook {
    fn verify(&self, process: &PreparedChildProcess) -> Result<bool>;
}
