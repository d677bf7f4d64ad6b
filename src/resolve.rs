//! Bind address resolution for the local node's endpoints.
//!
//! Addresses advertised by the dispatcher may be IPv4 literals or host
//! names. Literals pass through untouched; names are resolved through the
//! system resolver configuration using
//! [hickory-resolver](https://crates.io/crates/hickory-resolver).

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use log::debug;
use tokio::sync::OnceCell;

use crate::error::{Error, Result};

#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Resolve `name` to an IPv4 address.
    async fn lookup_ipv4(&self, name: &str) -> Result<Ipv4Addr>;
}

/// Resolver built from the system configuration on first lookup, so passes
/// that only see address literals never read it.
#[derive(Default)]
pub struct SystemResolver {
    resolver: OnceCell<TokioAsyncResolver>,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::default()
    }

    async fn resolver(&self) -> Result<&TokioAsyncResolver> {
        self.resolver
            .get_or_try_init(|| async {
                TokioAsyncResolver::tokio_from_system_conf().map_err(|e| Error::AddressResolution {
                    addr: "<resolver>".to_string(),
                    reason: format!("failed to load system resolver configuration: {}", e),
                })
            })
            .await
    }
}

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup_ipv4(&self, name: &str) -> Result<Ipv4Addr> {
        let lookup = self
            .resolver()
            .await?
            .lookup_ip(name)
            .await
            .map_err(|e| Error::AddressResolution {
                addr: name.to_string(),
                reason: e.to_string(),
            })?;

        lookup
            .iter()
            .find_map(|addr| match addr {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .ok_or_else(|| Error::AddressResolution {
                addr: name.to_string(),
                reason: "no IPv4 address found".to_string(),
            })
    }
}

/// Whether `addr` looks like an IPv4 literal: only digits and dots, with at
/// least one digit. No range checking is done.
pub fn is_ipv4_literal(addr: &str) -> bool {
    let mut digits = 0;
    for c in addr.chars() {
        match c {
            '.' => {}
            c if c.is_ascii_digit() => digits += 1,
            _ => return false,
        }
    }
    digits > 0
}

/// Turn an advertised address into a bind address.
pub async fn bind_addr(resolver: &dyn HostResolver, addr: &str) -> Result<String> {
    if is_ipv4_literal(addr) {
        return Ok(addr.to_string());
    }
    let resolved = resolver.lookup_ipv4(addr).await?;
    debug!("Resolved {} -> {}", addr, resolved);
    Ok(resolved.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Resolver backed by a fixed table; unknown names fail.
    pub(crate) struct StaticResolver(pub HashMap<String, Ipv4Addr>);

    impl StaticResolver {
        pub(crate) fn new(entries: &[(&str, &str)]) -> Self {
            Self(
                entries
                    .iter()
                    .map(|(name, ip)| (name.to_string(), ip.parse().unwrap()))
                    .collect(),
            )
        }
    }

    #[async_trait]
    impl HostResolver for StaticResolver {
        async fn lookup_ipv4(&self, name: &str) -> Result<Ipv4Addr> {
            self.0
                .get(name)
                .copied()
                .ok_or_else(|| Error::AddressResolution {
                    addr: name.to_string(),
                    reason: "no such host".to_string(),
                })
        }
    }

    #[test]
    fn literal_check() {
        assert!(is_ipv4_literal("10.0.0.5"));
        assert!(is_ipv4_literal("999.1.1.1"));
        assert!(!is_ipv4_literal("node1.internal"));
        assert!(!is_ipv4_literal("..."));
        assert!(!is_ipv4_literal(""));
        assert!(!is_ipv4_literal("fe80::1"));
    }

    #[tokio::test]
    async fn literal_passes_through() {
        let resolver = StaticResolver::new(&[]);
        assert_eq!(bind_addr(&resolver, "10.0.0.5").await.unwrap(), "10.0.0.5");
    }

    #[tokio::test]
    async fn literal_never_loads_system_resolver() {
        let resolver = SystemResolver::new();
        assert_eq!(bind_addr(&resolver, "10.0.0.5").await.unwrap(), "10.0.0.5");
        assert!(resolver.resolver.get().is_none());
    }

    #[tokio::test]
    async fn name_is_resolved() {
        let resolver = StaticResolver::new(&[("node1.internal", "10.0.0.9")]);
        assert_eq!(
            bind_addr(&resolver, "node1.internal").await.unwrap(),
            "10.0.0.9"
        );
    }

    #[tokio::test]
    async fn unresolvable_name_fails() {
        let resolver = StaticResolver::new(&[]);
        let err = bind_addr(&resolver, "nowhere.invalid").await.unwrap_err();
        assert!(matches!(err, Error::AddressResolution { addr, .. } if addr == "nowhere.invalid"));
    }
}
