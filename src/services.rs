//! Rendering of managed service definitions and restart decisions.
//!
//! Each managed service has a template; placeholders are the snapshot's
//! field names (`{{etcd_servers}}`, ...). A rendered file is written only
//! when it differs from what is installed, and a service is restarted when
//! its file changed or the init system does not report it running.

use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::init::InitSystem;
use crate::snapshot::ConfigSnapshot;

/// Read-only source of service templates.
pub trait TemplateStore: Send + Sync {
    fn template(&self, service: &str) -> Result<String>;
}

/// Templates stored as `<dir>/<service>.upstart.tmpl`.
#[derive(Debug, Clone)]
pub struct DirTemplateStore {
    dir: PathBuf,
}

impl DirTemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl TemplateStore for DirTemplateStore {
    fn template(&self, service: &str) -> Result<String> {
        let path = self.dir.join(format!("{}.upstart.tmpl", service));
        std::fs::read_to_string(&path).map_err(|source| Error::TemplateRead {
            service: service.to_string(),
            path,
            source,
        })
    }
}

/// A service definition rendered from the current snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedService {
    pub name: String,
    pub content: String,
}

pub struct ServiceReconciler<'a> {
    pub templates: &'a dyn TemplateStore,
    pub init: &'a dyn InitSystem,
    pub init_dir: &'a Path,
    pub services: &'a [String],
}

impl<'a> ServiceReconciler<'a> {
    fn registry(&self) -> Result<Handlebars<'static>> {
        let mut registry = Handlebars::new();
        // Unknown placeholders are errors rather than empty strings
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        for service in self.services {
            let template = self.templates.template(service)?;
            registry
                .register_template_string(service, template)
                .map_err(|e| Error::TemplateParse {
                    service: service.clone(),
                    source: Box::new(e),
                })?;
        }
        Ok(registry)
    }

    pub fn render(&self, snapshot: &ConfigSnapshot) -> Result<Vec<RenderedService>> {
        let registry = self.registry()?;
        self.services
            .iter()
            .map(|service| {
                let content =
                    registry
                        .render(service, snapshot)
                        .map_err(|source| Error::TemplateRender {
                            service: service.clone(),
                            source,
                        })?;
                Ok(RenderedService {
                    name: service.clone(),
                    content,
                })
            })
            .collect()
    }

    fn conf_path(&self, service: &str) -> PathBuf {
        self.init_dir.join(format!("{}.conf", service))
    }

    /// Write `rendered` unless the installed file already matches it.
    /// Returns whether the file changed.
    pub fn install(&self, rendered: &RenderedService) -> Result<bool> {
        let path = self.conf_path(&rendered.name);
        if let Ok(installed) = std::fs::read(&path) {
            if installed == rendered.content.as_bytes() {
                debug!("{:?} is up to date", path);
                return Ok(false);
            }
        }
        std::fs::write(&path, rendered.content.as_bytes())
            .map_err(|source| Error::ServiceFileWrite { path: path.clone(), source })?;
        info!("Wrote {:?}", path);
        Ok(true)
    }

    /// Render and install every managed service, then restart those that
    /// changed or are not running. Returns the restarted services in order.
    pub async fn reconcile(&self, snapshot: &ConfigSnapshot) -> Result<Vec<String>> {
        let mut changed = Vec::with_capacity(self.services.len());
        for rendered in self.render(snapshot)? {
            changed.push((self.install(&rendered)?, rendered.name));
        }

        let mut restarted = Vec::new();
        for (was_changed, service) in changed {
            if was_changed || !self.init.is_running(&service).await? {
                info!("Starting {}", service);
                self.init.restart(&service).await?;
                restarted.push(service);
            }
        }
        Ok(restarted)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::init::tests::FakeInit;
    use crate::snapshot::tests::sample;
    use std::collections::HashMap;

    pub(crate) struct MapTemplates(pub HashMap<String, String>);

    impl MapTemplates {
        pub(crate) fn standard() -> Self {
            Self(
                [
                    ("cadvisor", "exec cadvisor --identifier={{identifier}}\n"),
                    (
                        "kubelet",
                        "exec kubelet --address={{kubelet_bind_addr}} --etcd_servers={{etcd_servers}} --api_servers={{kubeapi_server}}\n",
                    ),
                    (
                        "proxy",
                        "exec proxy --bind_address={{proxy_bind_addr}} --etcd_servers={{etcd_servers}} --overlay={{overlay_type}}\n",
                    ),
                ]
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            )
        }
    }

    impl TemplateStore for MapTemplates {
        fn template(&self, service: &str) -> Result<String> {
            self.0.get(service).cloned().ok_or_else(|| Error::TemplateRead {
                service: service.to_string(),
                path: PathBuf::from(service),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            })
        }
    }

    pub(crate) fn services() -> Vec<String> {
        vec!["cadvisor".into(), "kubelet".into(), "proxy".into()]
    }

    #[test]
    fn renders_snapshot_fields_without_escaping() {
        let templates = MapTemplates::standard();
        let init = FakeInit::default();
        let dir = tempfile::tempdir().unwrap();
        let services = services();
        let reconciler = ServiceReconciler {
            templates: &templates,
            init: &init,
            init_dir: dir.path(),
            services: &services,
        };

        let rendered = reconciler.render(&sample()).unwrap();
        assert_eq!(rendered[1].name, "kubelet");
        assert_eq!(
            rendered[1].content,
            "exec kubelet --address=10.0.0.5 --etcd_servers=http://a:2379,http://b:2380 --api_servers=http://master:8080\n"
        );
    }

    #[test]
    fn unknown_placeholder_is_fatal() {
        let templates = MapTemplates(
            [("kubelet".to_string(), "--node={{node_name}}".to_string())]
                .into_iter()
                .collect(),
        );
        let init = FakeInit::default();
        let dir = tempfile::tempdir().unwrap();
        let services = vec!["kubelet".to_string()];
        let reconciler = ServiceReconciler {
            templates: &templates,
            init: &init,
            init_dir: dir.path(),
            services: &services,
        };

        let err = reconciler.render(&sample()).unwrap_err();
        assert!(matches!(err, Error::TemplateRender { service, .. } if service == "kubelet"));
    }

    #[test]
    fn shipped_templates_render() {
        let templates = DirTemplateStore::new(Path::new(env!("CARGO_MANIFEST_DIR")).join("files"));
        let init = FakeInit::default();
        let dir = tempfile::tempdir().unwrap();
        let services = services();
        let reconciler = ServiceReconciler {
            templates: &templates,
            init: &init,
            init_dir: dir.path(),
            services: &services,
        };

        let rendered = reconciler.render(&sample()).unwrap();
        assert_eq!(rendered.len(), 3);
        assert!(rendered[2].content.contains("--master=http://master:8080"));
        assert!(rendered.iter().all(|r| !r.content.contains("{{")));
    }

    #[test]
    fn directory_store_reads_upstart_templates() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("kubelet.upstart.tmpl"), "x").unwrap();
        let store = DirTemplateStore::new(dir.path());
        assert_eq!(store.template("kubelet").unwrap(), "x");
        assert!(matches!(store.template("proxy"), Err(Error::TemplateRead { .. })));
    }

    #[tokio::test]
    async fn second_pass_is_a_no_op() {
        let templates = MapTemplates::standard();
        let init = FakeInit::default();
        let dir = tempfile::tempdir().unwrap();
        let services = services();
        let reconciler = ServiceReconciler {
            templates: &templates,
            init: &init,
            init_dir: dir.path(),
            services: &services,
        };

        let first = reconciler.reconcile(&sample()).await.unwrap();
        assert_eq!(first, services);
        let written = std::fs::metadata(dir.path().join("kubelet.conf"))
            .unwrap()
            .modified()
            .unwrap();

        let second = reconciler.reconcile(&sample()).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(init.restarts().len(), 3);
        let after = std::fs::metadata(dir.path().join("kubelet.conf"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(written, after);
    }

    #[tokio::test]
    async fn stopped_service_is_restarted_even_if_unchanged() {
        let templates = MapTemplates::standard();
        let init = FakeInit::with_running(&["cadvisor", "kubelet", "proxy"]);
        let dir = tempfile::tempdir().unwrap();
        let services = services();
        let reconciler = ServiceReconciler {
            templates: &templates,
            init: &init,
            init_dir: dir.path(),
            services: &services,
        };
        reconciler.reconcile(&sample()).await.unwrap();

        init.running.lock().unwrap().remove("proxy");
        let restarted = reconciler.reconcile(&sample()).await.unwrap();
        assert_eq!(restarted, vec!["proxy".to_string()]);
    }

    #[tokio::test]
    async fn changed_content_is_rewritten() {
        let templates = MapTemplates::standard();
        let init = FakeInit::with_running(&["cadvisor", "kubelet", "proxy"]);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cadvisor.conf"), "stale").unwrap();
        let services = services();
        let reconciler = ServiceReconciler {
            templates: &templates,
            init: &init,
            init_dir: dir.path(),
            services: &services,
        };

        reconciler.reconcile(&sample()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("cadvisor.conf")).unwrap(),
            "exec cadvisor --identifier=kubernetes-0\n"
        );
    }

    #[tokio::test]
    async fn restart_failure_propagates() {
        let templates = MapTemplates::standard();
        let init = FakeInit {
            fail_restart: true,
            ..Default::default()
        };
        let dir = tempfile::tempdir().unwrap();
        let services = services();
        let reconciler = ServiceReconciler {
            templates: &templates,
            init: &init,
            init_dir: dir.path(),
            services: &services,
        };

        let err = reconciler.reconcile(&sample()).await.unwrap_err();
        assert!(matches!(err, Error::ServiceControl { action: "restart", .. }));
    }
}
