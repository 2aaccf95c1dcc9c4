//! Refence: opaque reference-tracking blobs
//!
//! The host kernel exposes a per-process control file that stores an
//! opaque blob used to correlate spawned work with its originator.
//! The spawner treats the blob as payload; it is applied before any
//! namespace is unshared, while the interface is still the host's.

use std::fs;

use crate::error::SpawnError;
use crate::Result;

const REFENCE_PATH: &str = "/proc/cm4all/refence/self";

/// Store `blob` in the process record of the calling process.
pub fn apply(blob: &str) -> Result<()> {
    fs::write(REFENCE_PATH, blob)
        .map_err(|err| SpawnError::Exec(format!("write {REFENCE_PATH}: {err}")))
}
