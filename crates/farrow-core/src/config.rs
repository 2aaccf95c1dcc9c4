//! Spawner configuration

use crate::error::SpawnError;
use crate::prepared::UidGid;
use crate::Result;

/// Process-wide spawn policy, immutable after startup.
#[derive(Debug, Clone, Default)]
pub struct SpawnConfig {
    /// Credentials substituted when a request specifies none.
    pub default_uid_gid: UidGid,

    /// Uids a request may ask for (besides the default pair).
    pub allowed_uids: Vec<libc::uid_t>,

    /// Gids a request may ask for (besides the default pair).
    pub allowed_gids: Vec<libc::gid_t>,
}

impl SpawnConfig {
    /// Check a requested uid/gid pair against the allow-lists.
    /// Root is never handed out; the spawner exists to shed
    /// privilege, not to forward it.
    pub fn verify(&self, uid_gid: &UidGid) -> Result<()> {
        if uid_gid.uid == 0 {
            return Err(SpawnError::Rejected("uid 0 is not allowed".to_string()));
        }

        if *uid_gid == self.default_uid_gid {
            return Ok(());
        }

        if !self.allowed_uids.contains(&uid_gid.uid) {
            return Err(SpawnError::Rejected(format!(
                "uid {} is not allowed",
                uid_gid.uid
            )));
        }

        if !self.allowed_gids.contains(&uid_gid.gid) {
            return Err(SpawnError::Rejected(format!(
                "gid {} is not allowed",
                uid_gid.gid
            )));
        }

        for &gid in &uid_gid.groups {
            if !self.allowed_gids.contains(&gid) {
                return Err(SpawnError::Rejected(format!(
                    "supplementary gid {gid} is not allowed"
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SpawnConfig {
        SpawnConfig {
            default_uid_gid: UidGid::new(500, 500),
            allowed_uids: vec![1000, 1001],
            allowed_gids: vec![1000, 100],
        }
    }

    #[test]
    fn default_pair_is_accepted() {
        let config = config();
        config.verify(&UidGid::new(500, 500)).unwrap();
    }

    #[test]
    fn listed_pairs_are_accepted() {
        let config = config();
        config.verify(&UidGid::new(1000, 1000)).unwrap();
        config.verify(&UidGid::new(1001, 100)).unwrap();
    }

    #[test]
    fn unlisted_ids_are_rejected() {
        let config = config();
        assert!(config.verify(&UidGid::new(1002, 1000)).is_err());
        assert!(config.verify(&UidGid::new(1000, 1002)).is_err());
    }

    #[test]
    fn root_is_always_rejected() {
        let mut config = config();
        config.allowed_uids.push(0);
        assert!(config.verify(&UidGid::new(0, 1000)).is_err());
    }

    #[test]
    fn supplementary_groups_are_checked() {
        let config = config();
        let mut uid_gid = UidGid::new(1000, 1000);
        uid_gid.groups = vec![100];
        config.verify(&uid_gid).unwrap();

        uid_gid.groups = vec![100, 4242];
        assert!(config.verify(&uid_gid).is_err());
    }
}
