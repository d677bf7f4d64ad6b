//! Relation data aggregation.
//!
//! Peer units publish key/value fragments on each relation. This module
//! reduces them to a [`PartialSnapshot`]. Nothing here validates
//! completeness; that is [`PartialSnapshot::validate`]'s job.
//!
//! Units are held in hash maps and the scan order over them is undefined.
//! Two places depend on it:
//!
//! * the `overlay_type` lookup returns the first matching peer, so peers
//!   that share the local private address but disagree on the overlay type
//!   yield either value;
//! * with several API server peers one of them is picked arbitrarily, as the
//!   control plane is assumed to have a single master.

use std::collections::HashMap;
use std::path::Path;

use log::{debug, info};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::resolve::{bind_addr, HostResolver};
use crate::snapshot::PartialSnapshot;
use crate::types::RelationKind;

pub const PRIVATE_ADDRESS: &str = "private-address";
pub const HOSTNAME: &str = "hostname";
pub const PORT: &str = "port";
pub const OVERLAY_TYPE: &str = "overlay_type";

pub type UnitData = HashMap<String, String>;

/// All relation data: relation name → unit id → key/value fragment.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct RelationData(pub HashMap<String, HashMap<String, UnitData>>);

impl RelationData {
    /// Read relation data from a JSON dump. A missing file means no
    /// relations have been joined yet.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No relation data at {:?}, assuming no relations", path);
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(Error::RelationRead {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| Error::RelationParse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn units(&self, kind: RelationKind) -> impl Iterator<Item = (&String, &UnitData)> {
        self.0.get(kind.as_str()).into_iter().flat_map(|units| units.iter())
    }

    /// Value of `attr` from the first unit on `kind` whose private address
    /// equals `private_address` and which sets `attr` non-empty.
    pub fn scoped_attr(
        &self,
        kind: RelationKind,
        private_address: &str,
        attr: &str,
    ) -> Option<String> {
        self.units(kind)
            .filter(|(_, data)| {
                data.get(PRIVATE_ADDRESS).map(String::as_str) == Some(private_address)
            })
            .find_map(|(_, data)| data.get(attr).filter(|v| !v.is_empty()).cloned())
    }

    /// Collect the values of `keys` from every peer on `kind`, skipping the
    /// local unit and any unit missing one of the keys. Repeated peers are
    /// kept as repeated entries.
    pub fn hosts(&self, kind: RelationKind, local_unit: &str, keys: &[&str]) -> Vec<Vec<String>> {
        let mut hosts = Vec::new();
        for (unit_id, data) in self.units(kind) {
            if unit_id == local_unit {
                continue;
            }
            let values: Option<Vec<String>> = keys
                .iter()
                .map(|k| data.get(*k).filter(|v| !v.is_empty()).cloned())
                .collect();
            match values {
                Some(values) => hosts.push(values),
                None => debug!("Skipping {} on {}: incomplete data", unit_id, kind.as_str()),
            }
        }
        hosts
    }
}

/// The local unit as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct LocalUnit {
    pub unit_name: String,
    pub private_address: String,
    pub public_address: String,
}

impl LocalUnit {
    /// Unit identity with `/` replaced so it can be used in file names.
    pub fn identifier(&self) -> String {
        self.unit_name.replace('/', "-")
    }
}

fn endpoint(host: &[String]) -> String {
    format!("http://{}:{}", host[0], host[1])
}

/// Reduce relation data and local facts to a partial snapshot.
pub async fn aggregate(
    relations: &RelationData,
    local: &LocalUnit,
    resolver: &dyn HostResolver,
) -> Result<PartialSnapshot> {
    let overlay_type =
        relations.scoped_attr(RelationKind::Network, &local.private_address, OVERLAY_TYPE);

    let mut etcd = relations.hosts(RelationKind::Etcd, &local.unit_name, &[HOSTNAME, PORT]);
    etcd.sort();
    let etcd_servers = etcd.iter().map(|h| endpoint(h)).collect::<Vec<_>>().join(",");

    let kubeapi_server = relations
        .hosts(RelationKind::Api, &local.unit_name, &[HOSTNAME, PORT])
        .pop()
        .map(|h| endpoint(&h))
        .unwrap_or_default();

    Ok(PartialSnapshot {
        overlay_type: overlay_type.unwrap_or_default(),
        kubelet_bind_addr: bind_addr(resolver, &local.private_address).await?,
        proxy_bind_addr: bind_addr(resolver, &local.public_address).await?,
        kubeapi_server,
        etcd_servers,
        identifier: local.identifier(),
    })
}
