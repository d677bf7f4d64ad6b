//! Host collaborators driven through their command line tools: the init
//! system's `service` wrapper and the account tools for group membership.

use std::ffi::OsStr;
use std::process::Output;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::error::{Error, Result};

const SERVICE_BIN: &str = "service";
const GROUPS_BIN: &str = "groups";
const USERMOD_BIN: &str = "usermod";

#[async_trait]
pub trait InitSystem: Send + Sync {
    async fn is_running(&self, service: &str) -> Result<bool>;
    async fn restart(&self, service: &str) -> Result<()>;
}

#[async_trait]
pub trait GroupMembership: Send + Sync {
    /// Make sure `user` is a member of `group`, adding it if needed.
    async fn ensure_member(&self, user: &str, group: &str) -> Result<()>;
}

/// Run a command to completion, capturing its output.
async fn run<I, S>(program: &str, args: I) -> std::io::Result<Output>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    debug!("Running {:?}", command);
    command.output().await
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Upstart-style job control through `service <name> <action>`.
#[derive(Debug, Default)]
pub struct ServiceCommand;

#[async_trait]
impl InitSystem for ServiceCommand {
    async fn is_running(&self, service: &str) -> Result<bool> {
        let output = run(SERVICE_BIN, [service, "status"])
            .await
            .map_err(|e| Error::ServiceControl {
                service: service.to_string(),
                action: "status",
                reason: e.to_string(),
            })?;
        // A failing status call means the job is unknown or stopped.
        if !output.status.success() {
            return Ok(false);
        }
        Ok(String::from_utf8_lossy(&output.stdout).contains("start/running"))
    }

    async fn restart(&self, service: &str) -> Result<()> {
        let output = run(SERVICE_BIN, [service, "restart"])
            .await
            .map_err(|e| Error::ServiceControl {
                service: service.to_string(),
                action: "restart",
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::ServiceControl {
                service: service.to_string(),
                action: "restart",
                reason: stderr_of(&output),
            });
        }
        Ok(())
    }
}

/// Whether the output of `groups <user>` lists `group`.
fn lists_group(groups_output: &str, group: &str) -> bool {
    let list = groups_output
        .split_once(':')
        .map_or(groups_output, |(_, rest)| rest);
    list.split_whitespace().any(|g| g == group)
}

#[derive(Debug, Default)]
pub struct Usermod;

#[async_trait]
impl GroupMembership for Usermod {
    async fn ensure_member(&self, user: &str, group: &str) -> Result<()> {
        let setup_err = |reason: String| Error::GroupSetup {
            user: user.to_string(),
            group: group.to_string(),
            reason,
        };

        let output = run(GROUPS_BIN, [user])
            .await
            .map_err(|e| setup_err(e.to_string()))?;
        if !output.status.success() {
            return Err(setup_err(stderr_of(&output)));
        }
        if lists_group(&String::from_utf8_lossy(&output.stdout), group) {
            debug!("{} already in group {}", user, group);
            return Ok(());
        }

        info!("Adding {} to group {}", user, group);
        let output = run(USERMOD_BIN, ["-a", "-G", group, user])
            .await
            .map_err(|e| setup_err(e.to_string()))?;
        if !output.status.success() {
            return Err(setup_err(stderr_of(&output)));
        }
        Ok(())
    }
}
