use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use tokio::net::lookup_host;
use tracing::warn;

/// Maps a host name to a dialable address. Never fails: on any resolution
/// problem it falls back to the configured static address.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, host: &str, fallback: Option<&str>) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

#[async_trait]
impl Resolve for DnsResolver {
    async fn resolve(&self, host: &str, fallback: Option<&str>) -> String {
        if host.parse::<Ipv4Addr>().is_ok() {
            return host.to_string();
        }
        let found = match lookup_host((host, 0)).await {
            Ok(mut addrs) => addrs.find_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4.to_string()),
                IpAddr::V6(_) => None,
            }),
            Err(err) => {
                warn!(component = "dns", %host, error = %err, "lookup failed");
                None
            }
        };
        found.unwrap_or_else(|| {
            let address = fallback.unwrap_or(host);
            warn!(component = "dns", %host, fallback = %address, "using fallback address");
            address.to_string()
        })
    }
}

/// Always answers with one fixed address.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    pub address: String,
}

impl StaticResolver {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Resolve for StaticResolver {
    async fn resolve(&self, _host: &str, _fallback: Option<&str>) -> String {
        self.address.clone()
    }
}
