// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote service configuration.
//!
//! [`ServiceDependencies`] can be built in code (`Default` plus `with_*`
//! builders), loaded from a JSON or YAML file, and overridden from the
//! environment:
//!
//! - `EXTEND_REQUEST_TIMEOUT_MS` - request / reference-lock timeout (<= 0 waits forever)
//! - `EXTEND_CONNECT_TIMEOUT_MS` - connect and datagram lookup timeout
//! - `EXTEND_PROXY_ADDRESSES` - comma-separated `host:port` list
//! - `EXTEND_NAME_SERVICE_ADDRESSES` - comma-separated `host:port` list
//! - `EXTEND_DISCOVERY_ADDRESS` - `host:port` for datagram name lookups

use crate::error::{Error, Result};
use crate::net::SocketOptions;
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::service::LockWait;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

pub const ENV_REQUEST_TIMEOUT_MS: &str = "EXTEND_REQUEST_TIMEOUT_MS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "EXTEND_CONNECT_TIMEOUT_MS";
pub const ENV_PROXY_ADDRESSES: &str = "EXTEND_PROXY_ADDRESSES";
pub const ENV_NAME_SERVICE_ADDRESSES: &str = "EXTEND_NAME_SERVICE_ADDRESSES";
pub const ENV_DISCOVERY_ADDRESS: &str = "EXTEND_DISCOVERY_ADDRESS";

/// Default request timeout (30 s).
pub const DEFAULT_REQUEST_TIMEOUT_MS: i64 = 30_000;

/// Default connect timeout (5 s).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Configuration shared by every remote service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDependencies {
    /// Cluster the proxy belongs to (datagram lookups are keyed by it)
    pub cluster_name: String,

    /// Name-service name of the remote proxy service
    pub remote_service_name: String,

    /// Identity of this client in invocation results
    pub member_name: String,

    /// Request and reference-lock timeout in ms; <= 0 waits indefinitely
    pub request_timeout_ms: i64,

    /// Connect timeout in ms (0 = OS default); also bounds datagram lookups
    pub connect_timeout_ms: u64,

    /// Static proxy addresses (`host:port`)
    pub proxy_addresses: Vec<String>,

    /// Name-service addresses used to resolve the proxy (`host:port`)
    pub name_service_addresses: Vec<String>,

    /// Datagram name-service address (`host:port`, unicast or multicast)
    pub discovery_address: Option<String>,

    /// Key cached resource proxies by security subject as well as scope
    pub subject_scoped: bool,

    /// Maximum accepted frame size in bytes
    pub max_frame_size: usize,

    /// Options for every socket the service opens
    pub socket: SocketOptions,
}

impl Default for ServiceDependencies {
    fn default() -> Self {
        Self {
            cluster_name: "extend".to_string(),
            remote_service_name: "ExtendProxy".to_string(),
            member_name: "extend-client".to_string(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            proxy_addresses: Vec::new(),
            name_service_addresses: Vec::new(),
            discovery_address: None,
            subject_scoped: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            socket: SocketOptions::default(),
        }
    }
}

impl ServiceDependencies {
    // ===== Builders =====

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_remote_service_name(mut self, name: impl Into<String>) -> Self {
        self.remote_service_name = name.into();
        self
    }

    pub fn with_member_name(mut self, name: impl Into<String>) -> Self {
        self.member_name = name.into();
        self
    }

    /// Request timeout in ms; <= 0 selects indefinite waits.
    pub fn with_request_timeout_ms(mut self, ms: i64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = crate::net::duration_to_ms(timeout);
        self
    }

    pub fn with_proxy_address(mut self, address: impl Into<String>) -> Self {
        self.proxy_addresses.push(address.into());
        self
    }

    pub fn with_name_service_address(mut self, address: impl Into<String>) -> Self {
        self.name_service_addresses.push(address.into());
        self
    }

    pub fn with_discovery_address(mut self, address: impl Into<String>) -> Self {
        self.discovery_address = Some(address.into());
        self
    }

    pub fn with_subject_scoped(mut self, scoped: bool) -> Self {
        self.subject_scoped = scoped;
        self
    }

    pub fn with_socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    // ===== Derived values =====

    /// Reference-lock wait derived from the request timeout.
    pub fn lock_wait(&self) -> LockWait {
        LockWait::from_timeout_ms(self.request_timeout_ms)
    }

    /// Response wait (`None` = indefinite).
    pub fn request_timeout(&self) -> Option<Duration> {
        u64::try_from(self.request_timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Connect timeout (`None` = OS default).
    pub fn connect_timeout(&self) -> Option<Duration> {
        if self.connect_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.connect_timeout_ms))
        }
    }

    pub fn proxy_socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        resolve_all(&self.proxy_addresses)
    }

    pub fn name_service_socket_addrs(&self) -> Result<Vec<SocketAddr>> {
        resolve_all(&self.name_service_addresses)
    }

    pub fn discovery_socket_addr(&self) -> Result<Option<SocketAddr>> {
        self.discovery_address.as_deref().map(resolve).transpose()
    }

    // ===== Validation =====

    pub fn validate(&self) -> Result<()> {
        if self.remote_service_name.is_empty() {
            return Err(Error::Config("remote_service_name cannot be empty".into()));
        }
        if self.cluster_name.is_empty() {
            return Err(Error::Config("cluster_name cannot be empty".into()));
        }
        if self.max_frame_size < crate::protocol::FRAME_HEADER_SIZE {
            return Err(Error::Config(format!(
                "max_frame_size must be at least {}",
                crate::protocol::FRAME_HEADER_SIZE
            )));
        }
        self.socket
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.proxy_socket_addrs()?;
        self.name_service_socket_addrs()?;
        self.discovery_socket_addr()?;
        Ok(())
    }

    // ===== Loading =====

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(Error::Config(format!(
                "unsupported configuration format {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| Error::Config(format!("invalid JSON: {}", e)))
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))
    }

    /// Save as pretty JSON.
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("cannot serialize: {}", e)))?;
        std::fs::write(path, content)
            .map_err(|e| Error::Config(format!("cannot write {}: {}", path.display(), e)))
    }

    /// Defaults overridden from the environment.
    pub fn from_env() -> Self {
        let mut deps = Self::default();
        deps.apply_env();
        deps
    }

    /// Apply `EXTEND_*` overrides. Unparsable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = var(ENV_REQUEST_TIMEOUT_MS) {
            match val.trim().parse::<i64>() {
                Ok(ms) => self.request_timeout_ms = ms,
                Err(_) => log::warn!("[CONFIG] ignoring {}={}", ENV_REQUEST_TIMEOUT_MS, val),
            }
        }
        if let Some(val) = var(ENV_CONNECT_TIMEOUT_MS) {
            match val.trim().parse::<u64>() {
                Ok(ms) => self.connect_timeout_ms = ms,
                Err(_) => log::warn!("[CONFIG] ignoring {}={}", ENV_CONNECT_TIMEOUT_MS, val),
            }
        }
        if let Some(val) = var(ENV_PROXY_ADDRESSES) {
            self.proxy_addresses = split_list(&val);
        }
        if let Some(val) = var(ENV_NAME_SERVICE_ADDRESSES) {
            self.name_service_addresses = split_list(&val);
        }
        if let Some(val) = var(ENV_DISCOVERY_ADDRESS) {
            let val = val.trim();
            self.discovery_address = (!val.is_empty()).then(|| val.to_string());
        }
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Resolve one `host:port` (first address wins).
pub fn resolve(address: &str) -> Result<SocketAddr> {
    address
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("invalid address '{}': {}", address, e)))?
        .next()
        .ok_or_else(|| Error::Config(format!("address '{}' resolved to nothing", address)))
}

fn resolve_all(addresses: &[String]) -> Result<Vec<SocketAddr>> {
    addresses.iter().map(|a| resolve(a)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let deps = ServiceDependencies::default();
        assert!(deps.validate().is_ok());
        assert_eq!(deps.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(
            deps.lock_wait(),
            LockWait::Bounded(Duration::from_secs(30))
        );
    }

    #[test]
    fn test_non_positive_timeout_is_indefinite() {
        let deps = ServiceDependencies::default().with_request_timeout_ms(0);
        assert_eq!(deps.lock_wait(), LockWait::Indefinite);
        assert_eq!(deps.request_timeout(), None);
        let deps = deps.with_request_timeout_ms(-1);
        assert_eq!(deps.lock_wait(), LockWait::Indefinite);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_REQUEST_TIMEOUT_MS, "250"),
            (ENV_CONNECT_TIMEOUT_MS, "bogus"),
            (ENV_PROXY_ADDRESSES, "127.0.0.1:9099, 127.0.0.1:9100,"),
            (ENV_DISCOVERY_ADDRESS, " "),
        ]
        .into_iter()
        .collect();
        let mut deps = ServiceDependencies::default().with_discovery_address("127.0.0.1:7574");
        deps.apply_vars(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(deps.request_timeout_ms, 250);
        assert_eq!(deps.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(deps.proxy_addresses, vec!["127.0.0.1:9099", "127.0.0.1:9100"]);
        assert_eq!(deps.discovery_address, None);
    }

    #[test]
    fn test_bad_address_fails_validation() {
        let deps = ServiceDependencies::default().with_proxy_address("not an address");
        assert!(matches!(deps.validate(), Err(Error::Config(_))));
    }
}
