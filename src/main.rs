//! kubejoin entry point.
//!
//! Invoked by the hook dispatcher once per event, either as
//! `kubejoin <event>` or through a symlink named after the event.

use std::path::Path;

use log::{error, info};

mod config;
mod error;
mod init;
mod orchestrator;
mod register;
mod relation;
mod resolve;
mod services;
mod snapshot;
mod types;

use config::AgentConfig;
use init::{ServiceCommand, Usermod};
use orchestrator::{Collaborators, Orchestrator, PassOutcome, PassSettings};
use register::HttpMinionApi;
use relation::{LocalUnit, RelationData};
use resolve::SystemResolver;
use services::DirTemplateStore;
use snapshot::StateFile;
use types::Trigger;

/// Event name from the first argument, or from the program name when run
/// through a hook symlink.
fn trigger_from_args() -> anyhow::Result<Trigger> {
    let mut args = std::env::args();
    let program = args.next().unwrap_or_default();
    let name = match args.next() {
        Some(event) => event,
        None => Path::new(&program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };
    name.parse().map_err(|e| {
        anyhow::anyhow!(
            "{}\nUsage: {} <config-changed|etcd-relation-changed|api-relation-changed|network-relation-changed>",
            e,
            program
        )
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let trigger = trigger_from_args()?;

    // Load configuration
    let cfg = AgentConfig::load()?;
    info!("Starting kubejoin for {} with config: {:?}", trigger, cfg);

    let relations = RelationData::load(&cfg.relations_path)?;

    let settings = PassSettings {
        local: LocalUnit {
            unit_name: cfg.unit_name.clone(),
            private_address: cfg.private_address.clone(),
            public_address: cfg.public_address().to_string(),
        },
        init_dir: cfg.init_dir.clone(),
        services: cfg.services.clone(),
        service_user: cfg.service_user.clone(),
        service_group: cfg.service_group.clone(),
        retry_delay: cfg.retry_delay(),
        state: StateFile::new(&cfg.state_path),
    };
    let collaborators = Collaborators {
        resolver: Box::new(SystemResolver::new()),
        templates: Box::new(DirTemplateStore::new(&cfg.template_dir)),
        init: Box::new(ServiceCommand),
        groups: Box::new(Usermod),
        minions: Box::new(HttpMinionApi::new(cfg.registration_timeout())?),
    };

    match Orchestrator::new(settings, collaborators)
        .reconcile(trigger, &relations)
        .await
    {
        Ok(PassOutcome::Incomplete { missing }) => {
            info!("Waiting for relation data: {:?}", missing);
            Ok(())
        }
        Ok(PassOutcome::Applied { prior, restarted }) => {
            info!("Pass complete ({:?}), restarted {:?}", prior, restarted);
            Ok(())
        }
        Err(e) => {
            error!("Reconciliation failed: {}", e);
            Err(e.into())
        }
    }
}
