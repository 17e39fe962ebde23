// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP connection initiator.

use super::{Connection, ConnectionInitiator, ConnectionListener, TcpConnection};
use crate::error::{Error, Result};
use crate::net::{SocketOptions, TcpSocket};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Opens [`TcpConnection`]s to proxy addresses.
#[derive(Debug, Clone)]
pub struct TcpInitiator {
    options: SocketOptions,
    connect_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    max_frame_size: usize,
}

impl Default for TcpInitiator {
    fn default() -> Self {
        Self::new(SocketOptions::default())
    }
}

impl TcpInitiator {
    pub fn new(options: SocketOptions) -> Self {
        Self {
            options,
            connect_timeout: Some(Duration::from_secs(5)),
            request_timeout: Some(Duration::from_secs(30)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Build from service configuration.
    pub fn from_dependencies(deps: &crate::config::ServiceDependencies) -> Self {
        Self {
            options: deps.socket.clone(),
            connect_timeout: deps.connect_timeout(),
            request_timeout: deps.request_timeout(),
            max_frame_size: deps.max_frame_size,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }
}

impl ConnectionInitiator for TcpInitiator {
    fn connect(
        &self,
        address: Option<SocketAddr>,
        listener: Weak<dyn ConnectionListener>,
    ) -> Result<Arc<dyn Connection>> {
        let address =
            address.ok_or_else(|| Error::transport("no proxy address to connect to"))?;

        let socket = TcpSocket::for_remote(&address, self.options.clone());
        socket.open()?;
        if let Err(e) = socket.connect(address, self.connect_timeout) {
            socket.close();
            return Err(Error::transport(format!(
                "could not connect to proxy at {}: {}",
                address, e
            )));
        }

        let connection = Arc::new(TcpConnection::start(
            socket,
            listener.clone(),
            self.request_timeout,
            self.max_frame_size,
        )?);
        if let Some(listener) = listener.upgrade() {
            listener.connection_opened(connection.id());
        }
        Ok(connection)
    }
}
