//! Request-scoped context.
//! One value per inbound call, built by the dispatcher from the transport
//! and passed down by parameter; the core never consults process-global
//! request state.

use std::collections::HashMap;
use std::net::ToSocketAddrs;

use crate::config::HubConfig;

/// Identity material injected by the transport layer. The hub never performs
/// certificate or Kerberos verification itself; the front proxy does, and
/// reports the outcome through these fields.
#[derive(Debug, Clone, Default)]
pub struct ClientIdentity {
    /// Kerberos principal authenticated by the transport (GSSAPI).
    pub principal: Option<String>,
    /// Client-certificate verification result, `SUCCESS` when verified.
    pub ssl_verify: Option<String>,
    /// Full subject DN of the verified client certificate.
    pub ssl_client_dn: Option<String>,
    /// Subject DN components by name (e.g. `CN`, `UID`).
    pub ssl_dn_components: HashMap<String, String>,
}

impl ClientIdentity {
    pub fn dn_component(&self, name: &str) -> Option<&str> {
        self.ssl_dn_components.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub config: HubConfig,
    /// Remote address as seen by the transport.
    pub remote_addr: Option<String>,
    /// RPC method being dispatched; consulted by the retry whitelist check.
    pub method: String,
    pub identity: ClientIdentity,
}

impl RequestContext {
    pub fn new(config: HubConfig, method: impl Into<String>) -> Self {
        Self { config, remote_addr: None, method: method.into(), identity: ClientIdentity::default() }
    }

    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Host IP that sessions are keyed by. With client-IP checking disabled
    /// every session shares the sentinel `-`. Loopback is canonicalized to
    /// the local hostname's address so sessions created over 127.0.0.1 stay
    /// resolvable from the host's real address.
    pub fn remote_ip(&self) -> String {
        if !self.config.check_client_ip {
            return "-".to_string();
        }
        let addr = self.remote_addr.as_deref().unwrap_or("127.0.0.1");
        if addr == "127.0.0.1" {
            if let Some(local) = canonical_local_ip() {
                return local;
            }
        }
        addr.to_string()
    }
}

fn canonical_local_ip() -> Option<String> {
    let host = whoami::fallible::hostname().ok()?;
    let mut addrs = (host.as_str(), 0u16).to_socket_addrs().ok()?;
    addrs.next().map(|a| a.ip().to_string())
}
