//! Resource limits for spawned children
//!
//! The wire carries a resource index byte plus a raw `struct rlimit`;
//! the table keeps one optional entry per known resource and applies
//! the populated ones with `setrlimit` in the child.

use nix::sys::resource::{setrlimit, Resource};

use crate::error::SpawnError;
use crate::Result;

/// Number of addressable resource slots (`RLIM_NLIMITS`).
pub const RLIMIT_SLOTS: usize = 16;

/// One limit pair as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RlimitValue {
    pub soft: u64,
    pub hard: u64,
}

/// Sparse table of resource limits, indexed by the kernel's resource
/// numbers.
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    values: [Option<RlimitValue>; RLIMIT_SLOTS],
}

impl ResourceLimits {
    /// Store one entry; an index outside the table is malformed.
    pub fn set(&mut self, index: u8, value: RlimitValue) -> Result<()> {
        let slot = self
            .values
            .get_mut(usize::from(index))
            .ok_or(SpawnError::MalformedPayload)?;
        *slot = Some(value);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, index: u8) -> Option<RlimitValue> {
        self.values.get(usize::from(index)).copied().flatten()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Apply every populated entry to the calling process.
    pub fn apply(&self) -> Result<()> {
        for (index, value) in self
            .values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.map(|v| (i, v)))
        {
            let resource = resource_from_index(index).ok_or_else(|| {
                SpawnError::Exec(format!("unknown resource limit index {index}"))
            })?;
            setrlimit(resource, value.soft, value.hard)?;
        }
        Ok(())
    }
}

/// Map a kernel resource number to the typed constant.
fn resource_from_index(index: usize) -> Option<Resource> {
    let resource = match index {
        0 => Resource::RLIMIT_CPU,
        1 => Resource::RLIMIT_FSIZE,
        2 => Resource::RLIMIT_DATA,
        3 => Resource::RLIMIT_STACK,
        4 => Resource::RLIMIT_CORE,
        5 => Resource::RLIMIT_RSS,
        6 => Resource::RLIMIT_NPROC,
        7 => Resource::RLIMIT_NOFILE,
        8 => Resource::RLIMIT_MEMLOCK,
        9 => Resource::RLIMIT_AS,
        10 => Resource::RLIMIT_LOCKS,
        11 => Resource::RLIMIT_SIGPENDING,
        12 => Resource::RLIMIT_MSGQUEUE,
        13 => Resource::RLIMIT_NICE,
        14 => Resource::RLIMIT_RTPRIO,
        15 => Resource::RLIMIT_RTTIME,
        _ => return None,
    };
    Some(resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut limits = ResourceLimits::default();
        assert!(limits.is_empty());

        limits
            .set(
                7,
                RlimitValue {
                    soft: 1024,
                    hard: 4096,
                },
            )
            .unwrap();
        assert!(!limits.is_empty());
        assert_eq!(
            limits.get(7),
            Some(RlimitValue {
                soft: 1024,
                hard: 4096
            })
        );
        assert_eq!(limits.get(6), None);
    }

    #[test]
    fn out_of_range_index_is_malformed() {
        let mut limits = ResourceLimits::default();
        assert!(matches!(
            limits.set(16, RlimitValue { soft: 0, hard: 0 }),
            Err(SpawnError::MalformedPayload)
        ));
    }

    #[test]
    fn index_mapping_matches_kernel_numbers() {
        assert_eq!(resource_from_index(0), Some(Resource::RLIMIT_CPU));
        assert_eq!(resource_from_index(4), Some(Resource::RLIMIT_CORE));
        assert_eq!(resource_from_index(7), Some(Resource::RLIMIT_NOFILE));
        assert_eq!(resource_from_index(9), Some(Resource::RLIMIT_AS));
        assert_eq!(resource_from_index(16), None);
    }

    #[test]
    fn apply_nofile_within_current_hard_limit() {
        let (soft, hard) = nix::sys::resource::getrlimit(Resource::RLIMIT_NOFILE).unwrap();
        let mut limits = ResourceLimits::default();
        limits.set(7, RlimitValue { soft, hard }).unwrap();
        limits.apply().unwrap();
    }
}
