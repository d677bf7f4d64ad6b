//! The configuration snapshot and its persisted marker file.

use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Snapshot as produced by aggregation, before the completeness check.
/// Absent values are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialSnapshot {
    pub overlay_type: String,
    pub kubelet_bind_addr: String,
    pub proxy_bind_addr: String,
    pub kubeapi_server: String,
    pub etcd_servers: String,
    pub identifier: String,
}

impl PartialSnapshot {
    /// Keys that must be non-empty before anything on the host is touched.
    pub const REQUIRED: [&'static str; 3] = ["etcd_servers", "kubeapi_server", "overlay_type"];

    pub fn missing(&self) -> Vec<&'static str> {
        Self::REQUIRED
            .iter()
            .copied()
            .filter(|key| match *key {
                "etcd_servers" => self.etcd_servers.is_empty(),
                "kubeapi_server" => self.kubeapi_server.is_empty(),
                "overlay_type" => self.overlay_type.is_empty(),
                _ => false,
            })
            .collect()
    }

    pub fn validate(self) -> Result<ConfigSnapshot> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(Error::ConfigurationIncomplete {
                missing,
                partial: self,
            });
        }
        Ok(ConfigSnapshot {
            overlay_type: self.overlay_type,
            kubelet_bind_addr: self.kubelet_bind_addr,
            proxy_bind_addr: self.proxy_bind_addr,
            kubeapi_server: self.kubeapi_server,
            etcd_servers: self.etcd_servers,
            identifier: self.identifier,
        })
    }
}

/// A validated snapshot. Built fresh for every pass and passed down the call
/// chain; it is also the data every service template is rendered against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub overlay_type: String,
    pub kubelet_bind_addr: String,
    pub proxy_bind_addr: String,
    pub kubeapi_server: String,
    pub etcd_servers: String,
    pub identifier: String,
}

impl ConfigSnapshot {
    fn fields(&self) -> [(&'static str, &str); 6] {
        [
            ("overlay_type", self.overlay_type.as_str()),
            ("kubelet_bind_addr", self.kubelet_bind_addr.as_str()),
            ("proxy_bind_addr", self.proxy_bind_addr.as_str()),
            ("kubeapi_server", self.kubeapi_server.as_str()),
            ("etcd_servers", self.etcd_servers.as_str()),
            ("identifier", self.identifier.as_str()),
        ]
    }

    /// Hex SHA-256 over the six fields in a fixed order.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in self.fields() {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Names of the fields whose values differ from `other`.
    pub fn changed_keys(&self, other: &ConfigSnapshot) -> Vec<&'static str> {
        self.fields()
            .iter()
            .zip(other.fields().iter())
            .filter(|(a, b)| a.1 != b.1)
            .map(|(a, _)| a.0)
            .collect()
    }
}

/// How the current snapshot relates to the last one applied on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PriorInstall {
    FirstInstall,
    Unchanged,
    Changed(Vec<&'static str>),
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    fingerprint: String,
    snapshot: ConfigSnapshot,
}

/// The local marker file recording the last fully applied snapshot.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last applied snapshot. An unreadable or corrupt marker is logged and
    /// treated as a first install.
    pub fn load(&self) -> Result<Option<ConfigSnapshot>> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(Error::StateRead {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        // Invalid UTF-8 surfaces here as a JSON error, like any other corruption
        match serde_json::from_slice::<PersistedState>(&raw) {
            Ok(state) if state.fingerprint == state.snapshot.fingerprint() => {
                Ok(Some(state.snapshot))
            }
            Ok(_) => {
                warn!("Fingerprint mismatch in {:?}, ignoring it", self.path);
                Ok(None)
            }
            Err(e) => {
                warn!("Ignoring corrupt state file {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    pub fn compare(&self, current: &ConfigSnapshot) -> Result<PriorInstall> {
        Ok(match self.load()? {
            None => PriorInstall::FirstInstall,
            Some(previous) if previous == *current => PriorInstall::Unchanged,
            Some(previous) => PriorInstall::Changed(current.changed_keys(&previous)),
        })
    }

    pub fn save(&self, snapshot: &ConfigSnapshot) -> Result<()> {
        let state = PersistedState {
            fingerprint: snapshot.fingerprint(),
            snapshot: snapshot.clone(),
        };
        let encoded = serde_json::to_string_pretty(&state)?;
        std::fs::write(&self.path, encoded).map_err(|source| Error::StateWrite {
            path: self.path.clone(),
            source,
        })?;
        info!("Saved snapshot {} to {:?}", state.fingerprint, self.path);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample() -> ConfigSnapshot {
        ConfigSnapshot {
            overlay_type: "vxlan".to_string(),
            kubelet_bind_addr: "10.0.0.5".to_string(),
            proxy_bind_addr: "192.168.1.9".to_string(),
            kubeapi_server: "http://master:8080".to_string(),
            etcd_servers: "http://a:2379,http://b:2380".to_string(),
            identifier: "kubernetes-0".to_string(),
        }
    }

    #[test]
    fn validate_reports_every_missing_key() {
        let partial = PartialSnapshot {
            kubelet_bind_addr: "10.0.0.5".to_string(),
            identifier: "kubernetes-0".to_string(),
            ..Default::default()
        };
        match partial.validate() {
            Err(Error::ConfigurationIncomplete { missing, partial }) => {
                assert_eq!(missing, vec!["etcd_servers", "kubeapi_server", "overlay_type"]);
                assert_eq!(partial.identifier, "kubernetes-0");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn validate_accepts_complete_snapshot() {
        let s = sample();
        let partial = PartialSnapshot {
            overlay_type: s.overlay_type.clone(),
            kubelet_bind_addr: s.kubelet_bind_addr.clone(),
            proxy_bind_addr: s.proxy_bind_addr.clone(),
            kubeapi_server: s.kubeapi_server.clone(),
            etcd_servers: s.etcd_servers.clone(),
            identifier: s.identifier.clone(),
        };
        assert_eq!(partial.validate().unwrap(), s);
    }

    #[test]
    fn state_file_detects_prior_install() {
        let dir = tempfile::tempdir().unwrap();
        let state = StateFile::new(dir.path().join(".unit-state"));
        let snapshot = sample();

        assert_eq!(state.compare(&snapshot).unwrap(), PriorInstall::FirstInstall);
        state.save(&snapshot).unwrap();
        assert_eq!(state.load().unwrap(), Some(snapshot.clone()));
        assert_eq!(state.compare(&snapshot).unwrap(), PriorInstall::Unchanged);

        let moved = ConfigSnapshot {
            kubeapi_server: "http://master2:8080".to_string(),
            ..snapshot
        };
        assert_eq!(
            state.compare(&moved).unwrap(),
            PriorInstall::Changed(vec!["kubeapi_server"])
        );
    }

    #[test]
    fn corrupt_state_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".unit-state");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(StateFile::new(&path).load().unwrap(), None);
    }

    #[test]
    fn non_utf8_state_file_counts_as_first_install() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".unit-state");
        std::fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).unwrap();
        let state = StateFile::new(&path);
        assert_eq!(state.compare(&sample()).unwrap(), PriorInstall::FirstInstall);

        state.save(&sample()).unwrap();
        assert_eq!(state.compare(&sample()).unwrap(), PriorInstall::Unchanged);
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.overlay_type = "udp".to_string();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
