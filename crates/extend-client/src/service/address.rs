// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Proxy address providers.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::net::{SocketAddr, ToSocketAddrs};

/// Source of candidate proxy addresses.
pub trait AddressProvider: Send + Sync {
    /// Addresses to try, in order.
    fn candidates(&self) -> Vec<SocketAddr>;

    /// A connection to `address` was established.
    fn accept(&self, _address: SocketAddr) {}

    /// A connection to `address` failed.
    fn reject(&self, _address: SocketAddr, _error: &Error) {}
}

/// Fixed address list.
///
/// The last accepted address is tried first; the rest keep their order
/// unless the provider was built with [`ListAddressProvider::shuffled`].
pub struct ListAddressProvider {
    addresses: Vec<SocketAddr>,
    preferred: Mutex<Option<SocketAddr>>,
    shuffle: bool,
}

impl ListAddressProvider {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self {
            addresses,
            preferred: Mutex::new(None),
            shuffle: false,
        }
    }

    /// Parse `host:port` entries; every entry must resolve.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let mut addresses = Vec::with_capacity(entries.len());
        for entry in entries {
            addresses.extend(resolve_entry(entry.as_ref())?);
        }
        Ok(Self::new(addresses))
    }

    /// Spread load across proxies by randomizing the order per attempt.
    pub fn shuffled(mut self) -> Self {
        self.shuffle = true;
        self
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

impl AddressProvider for ListAddressProvider {
    fn candidates(&self) -> Vec<SocketAddr> {
        let mut candidates = self.addresses.clone();
        if self.shuffle {
            fastrand::shuffle(&mut candidates);
        }
        if let Some(preferred) = *self.preferred.lock() {
            if let Some(pos) = candidates.iter().position(|a| *a == preferred) {
                candidates[..=pos].rotate_right(1);
            }
        }
        candidates
    }

    fn accept(&self, address: SocketAddr) {
        *self.preferred.lock() = Some(address);
    }

    fn reject(&self, address: SocketAddr, error: &Error) {
        log::debug!("[ADDR] rejected {}: {}", address, error);
        let mut preferred = self.preferred.lock();
        if *preferred == Some(address) {
            *preferred = None;
        }
    }
}

/// Resolve one `host:port` entry to every address it names.
fn resolve_entry(entry: &str) -> Result<Vec<SocketAddr>> {
    let resolved: Vec<SocketAddr> = entry
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("invalid address '{}': {}", entry, e)))?
        .collect();
    if resolved.is_empty() {
        return Err(Error::Config(format!("address '{}' resolved to nothing", entry)));
    }
    log::trace!("[ADDR] {} -> {:?}", entry, resolved);
    Ok(resolved)
}

/// Read a name-service reply of the form `[host, port, host, port, ...]`.
pub(crate) fn parse_address_reply(value: &crate::protocol::Value) -> Result<Vec<SocketAddr>> {
    let fields = value.expect_array("proxy address reply")?;
    if fields.is_empty() || fields.len() % 2 != 0 {
        return Err(Error::protocol(format!(
            "proxy address reply must hold host/port pairs, got {} field(s)",
            fields.len()
        )));
    }
    let mut addresses = Vec::new();
    for pair in fields.chunks(2) {
        let host = pair[0].expect_text("proxy host")?;
        let port = pair[1].expect_int("proxy port")?;
        let port = u16::try_from(port)
            .map_err(|_| Error::protocol(format!("proxy port {} out of range", port)))?;
        addresses.extend(resolve_entry(&format!("{}:{}", host, port))?);
    }
    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;

    #[test]
    fn test_accepted_address_is_tried_first() {
        let provider =
            ListAddressProvider::parse(&["127.0.0.1:9001", "127.0.0.1:9002", "127.0.0.1:9003"])
                .unwrap();
        let third: SocketAddr = "127.0.0.1:9003".parse().unwrap();
        provider.accept(third);

        let candidates = provider.candidates();
        assert_eq!(candidates[0], third);
        assert_eq!(candidates.len(), 3);

        provider.reject(third, &Error::ConnectionClosed);
        assert_eq!(provider.candidates(), provider.addresses().to_vec());
    }

    #[test]
    fn test_shuffled_keeps_every_address() {
        let provider = ListAddressProvider::parse(&["127.0.0.1:1", "127.0.0.1:2"])
            .unwrap()
            .shuffled();
        let mut candidates = provider.candidates();
        candidates.sort();
        assert_eq!(candidates, provider.addresses().to_vec());
    }

    #[test]
    fn test_parse_reply_pairs() {
        let reply = Value::Array(vec![Value::from("127.0.0.1"), Value::from(9099i64)]);
        let addrs = parse_address_reply(&reply).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:9099".parse::<SocketAddr>().unwrap()]);

        let odd = Value::Array(vec![Value::from("127.0.0.1")]);
        assert!(matches!(parse_address_reply(&odd), Err(Error::Protocol(_))));
        let bad_port = Value::Array(vec![Value::from("127.0.0.1"), Value::from(70000i64)]);
        assert!(parse_address_reply(&bad_port).is_err());
    }
}
