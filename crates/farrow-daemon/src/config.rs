//! Daemon configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use farrow_core::{SpawnConfig, UidGid};

/// Configuration for the daemon, from the optional TOML file plus
/// command-line overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Where to bind the seed datagram socket.
    pub socket_path: PathBuf,

    /// Credentials used when a request specifies none.
    pub default_uid: u32,
    pub default_gid: u32,

    /// Additional uids/gids requests may ask for.
    pub allowed_uids: Vec<u32>,
    pub allowed_gids: Vec<u32>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/farrow/spawn.sock"),
            // nobody/nogroup
            default_uid: 65534,
            default_gid: 65534,
            allowed_uids: Vec::new(),
            allowed_gids: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Load the configuration file, or the defaults without one.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let config = config::Config::builder()
            .add_source(config::File::from(path.to_path_buf()))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// The spawn policy handed to the server.
    #[must_use]
    pub fn spawn_config(&self) -> SpawnConfig {
        SpawnConfig {
            default_uid_gid: UidGid::new(self.default_uid, self.default_gid),
            allowed_uids: self.allowed_uids.clone(),
            allowed_gids: self.allowed_gids.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_map_to_nobody() {
        let config = DaemonConfig::default();
        let spawn = config.spawn_config();
        assert_eq!(spawn.default_uid_gid, UidGid::new(65534, 65534));
        assert!(spawn.allowed_uids.is_empty());
    }

    #[test]
    fn missing_file_path_yields_defaults() {
        let config = DaemonConfig::load(None).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/run/farrow/spawn.sock"));
    }
}
