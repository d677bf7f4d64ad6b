use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentConfig {
    pub unit_name: String,
    pub private_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
    pub relations_path: PathBuf,
    pub template_dir: PathBuf,
    pub init_dir: PathBuf,
    pub state_path: PathBuf,
    pub services: Vec<String>,
    pub service_user: String,
    pub service_group: String,
    pub registration_timeout_secs: u64,
    pub retry_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            unit_name: String::new(),
            private_address: String::new(),
            public_address: None,
            relations_path: "relations.json".into(),
            template_dir: "files".into(),
            init_dir: "/etc/init".into(),
            state_path: ".unit-state".into(),
            services: vec!["cadvisor".into(), "kubelet".into(), "proxy".into()],
            service_user: "kubernetes".into(),
            service_group: "docker".into(),
            registration_timeout_secs: 30,
            retry_delay_ms: 1000,
        }
    }
}

impl AgentConfig {
    pub fn load() -> anyhow::Result<Self> {
        Self::from_figment(
            Figment::from(Serialized::defaults(AgentConfig::default()))
                .merge(Toml::file("kubejoin.toml"))
                .merge(Json::file("kubejoin.json"))
                .merge(Env::prefixed("KUBEJOIN_"))
                // The hook dispatcher exports the unit identity itself
                .merge(
                    Env::raw()
                        .only(&["JUJU_UNIT_NAME"])
                        .map(|_| "unit_name".into()),
                ),
        )
    }

    fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: AgentConfig = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if config.unit_name.is_empty() {
            anyhow::bail!("unit_name is not set");
        }
        if config.private_address.is_empty() {
            anyhow::bail!("private_address is not set");
        }
        Ok(config)
    }

    /// Public address, falling back to the private one on single-homed hosts.
    pub fn public_address(&self) -> &str {
        self.public_address
            .as_deref()
            .unwrap_or(&self.private_address)
    }

    pub fn registration_timeout(&self) -> Duration {
        Duration::from_secs(self.registration_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Figment {
        Figment::from(Serialized::defaults(AgentConfig::default()))
    }

    #[test]
    fn layers_over_defaults() {
        let config = AgentConfig::from_figment(base().merge(Toml::string(
            r#"
            unit_name = "kubernetes/3"
            private_address = "10.0.0.5"
            services = ["kubelet"]
            "#,
        )))
        .unwrap();

        assert_eq!(config.unit_name, "kubernetes/3");
        assert_eq!(config.public_address(), "10.0.0.5");
        assert_eq!(config.services, vec!["kubelet".to_string()]);
        assert_eq!(config.init_dir, PathBuf::from("/etc/init"));
        assert_eq!(config.retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn requires_unit_identity() {
        let err = AgentConfig::from_figment(
            base().merge(Toml::string(r#"private_address = "10.0.0.5""#)),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unit_name"));
    }

    #[test]
    fn requires_private_address() {
        let err =
            AgentConfig::from_figment(base().merge(Toml::string(r#"unit_name = "kubernetes/0""#)))
                .unwrap_err();
        assert!(err.to_string().contains("private_address"));
    }
}
