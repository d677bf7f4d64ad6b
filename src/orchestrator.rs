//! One reconciliation pass, run once per trigger event.
//!
//! aggregate → validate → group setup → services → registration → persist.
//! An incomplete snapshot ends the pass before anything on the host is
//! touched. Any later failure propagates and leaves the marker file alone,
//! so the next event starts over from scratch.
//!
//! Passes are not locked against each other; the dispatcher is expected to
//! deliver events one at a time.

use std::path::PathBuf;

use log::{info, warn};

use crate::error::{Error, Result};
use crate::init::{GroupMembership, InitSystem};
use crate::register::{HostFacts, MinionApi, NodeRegistrar};
use crate::relation::{aggregate, LocalUnit, RelationData};
use crate::resolve::HostResolver;
use crate::services::{ServiceReconciler, TemplateStore};
use crate::snapshot::{PriorInstall, StateFile};
use crate::types::Trigger;

/// Everything the pass talks to outside the process.
pub struct Collaborators {
    pub resolver: Box<dyn HostResolver>,
    pub templates: Box<dyn TemplateStore>,
    pub init: Box<dyn InitSystem>,
    pub groups: Box<dyn GroupMembership>,
    pub minions: Box<dyn MinionApi>,
}

/// Host-level settings for a pass.
#[derive(Debug, Clone)]
pub struct PassSettings {
    pub local: LocalUnit,
    pub init_dir: PathBuf,
    pub services: Vec<String>,
    pub service_user: String,
    pub service_group: String,
    pub retry_delay: std::time::Duration,
    pub state: StateFile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Required relation data is missing; nothing was changed.
    Incomplete { missing: Vec<&'static str> },
    Applied {
        prior: PriorInstall,
        restarted: Vec<String>,
    },
}

pub struct Orchestrator {
    pub settings: PassSettings,
    pub collaborators: Collaborators,
    /// Supplies host facts for registration from the resolved private
    /// address. Swappable so tests do not depend on the build host.
    pub host_facts: fn(&str) -> HostFacts,
}

impl Orchestrator {
    pub fn new(settings: PassSettings, collaborators: Collaborators) -> Self {
        Self {
            settings,
            collaborators,
            host_facts: |addr| HostFacts::collect(addr),
        }
    }

    pub async fn reconcile(
        &self,
        trigger: Trigger,
        relations: &RelationData,
    ) -> Result<PassOutcome> {
        let c = &self.collaborators;
        let s = &self.settings;
        info!("Reconciling on {}", trigger);

        let partial = aggregate(relations, &s.local, &*c.resolver).await?;
        let snapshot = match partial.validate() {
            Ok(snapshot) => snapshot,
            Err(Error::ConfigurationIncomplete { missing, partial }) => {
                warn!("Missing data for {:?} {:?}", missing, partial);
                return Ok(PassOutcome::Incomplete { missing });
            }
            Err(e) => return Err(e),
        };
        info!("Running with {:?}", snapshot);

        // The marker only informs the logs; it never blocks a pass
        let prior = match s.state.compare(&snapshot) {
            Ok(prior) => prior,
            Err(e) => {
                warn!("Treating as first install: {}", e);
                PriorInstall::FirstInstall
            }
        };
        match &prior {
            PriorInstall::FirstInstall => {
                info!("No previous install recorded in {:?}", s.state.path())
            }
            PriorInstall::Unchanged => {
                info!("Snapshot {} unchanged since last pass", snapshot.fingerprint())
            }
            PriorInstall::Changed(keys) => info!("Snapshot changed since last pass: {:?}", keys),
        }

        c.groups.ensure_member(&s.service_user, &s.service_group).await?;

        let restarted = ServiceReconciler {
            templates: &*c.templates,
            init: &*c.init,
            init_dir: &s.init_dir,
            services: &s.services,
        }
        .reconcile(&snapshot)
        .await?;

        info!("Registering machine");
        let facts = (self.host_facts)(&snapshot.kubelet_bind_addr);
        NodeRegistrar {
            api: &*c.minions,
            retry_delay: s.retry_delay,
        }
        .register(&snapshot.kubeapi_server, &facts)
        .await?;

        s.state.save(&snapshot)?;
        Ok(PassOutcome::Applied { prior, restarted })
    }
}
