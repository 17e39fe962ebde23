// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP proxy server.
//!
//! One accept thread hands each connection to its own session thread. A
//! session thread reads frames, answers control frames on channel 0 and
//! routes requests to the [`ProxySession`]. Requests on one connection are
//! handled in arrival order.

use super::{ProxyBackend, ProxySession};
use crate::error::{Error, Result};
use crate::net::{SocketOptions, SocketStream, TcpSocket, TcpSocketAccepter};
use crate::protocol::{
    AcceptChannelBody, ChannelUri, Frame, FrameKind, OpenChannelBody, Request, Response, Value,
    CONTROL_CHANNEL, DEFAULT_MAX_FRAME_SIZE,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Accept poll interval; bounds how long `stop()` waits for the accept thread.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Proxy server hosting a [`ProxyBackend`] over TCP.
pub struct ProxyServer {
    accepter: Arc<TcpSocketAccepter>,
    backend: Arc<dyn ProxyBackend>,
    sessions: Arc<DashMap<u64, TcpSocket>>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    max_frame_size: usize,
}

impl ProxyServer {
    /// Bind the listening socket. Port 0 picks a free port.
    pub fn bind(
        address: SocketAddr,
        options: SocketOptions,
        backend: Arc<dyn ProxyBackend>,
    ) -> Result<Self> {
        let accepter = TcpSocketAccepter::new(address, options);
        accepter.set_accept_timeout(Some(ACCEPT_POLL))?;
        accepter.open()?;
        log::info!("[PROXY] listening on {}", accepter.local_address());
        Ok(Self {
            accepter: Arc::new(accepter),
            backend,
            sessions: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        })
    }

    pub fn local_address(&self) -> SocketAddr {
        self.accepter.local_address()
    }

    /// Connections currently being served.
    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Start the accept thread.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::InvalidState("proxy server already started".into()));
        }
        let accepter = Arc::clone(&self.accepter);
        let backend = Arc::clone(&self.backend);
        let sessions = Arc::clone(&self.sessions);
        let running = Arc::clone(&self.running);
        let max_frame_size = self.max_frame_size;

        let handle = thread::Builder::new()
            .name("extend-proxy-accept".into())
            .spawn(move || {
                let next_session = AtomicU64::new(1);
                while running.load(Ordering::Acquire) {
                    match accepter.accept() {
                        Ok(Some(socket)) => {
                            let id = next_session.fetch_add(1, Ordering::Relaxed);
                            spawn_session(id, socket, &backend, &sessions, max_frame_size);
                        }
                        Ok(None) => {}
                        Err(Error::SocketClosed) => break,
                        Err(e) => {
                            log::warn!("[PROXY] accept failed: {}", e);
                            thread::sleep(ACCEPT_POLL);
                        }
                    }
                }
                log::debug!("[PROXY] accept loop exited");
            })?;
        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting and drop every client connection.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.accepter.close();
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        let ids: Vec<u64> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, socket)) = self.sessions.remove(&id) {
                socket.close();
            }
        }
        log::info!("[PROXY] stopped");
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        if self.running.load(Ordering::Acquire) {
            self.stop();
        }
    }
}

fn spawn_session(
    id: u64,
    socket: TcpSocket,
    backend: &Arc<dyn ProxyBackend>,
    sessions: &Arc<DashMap<u64, TcpSocket>>,
    max_frame_size: usize,
) {
    let streams = socket
        .input_stream()
        .and_then(|input| Ok((input, socket.output_stream()?)));
    let (input, output) = match streams {
        Ok(streams) => streams,
        Err(e) => {
            log::debug!("[PROXY] session {} could not start: {}", id, e);
            socket.close();
            return;
        }
    };
    let remote = socket.remote_address();
    sessions.insert(id, socket);

    let writer = Arc::new(Mutex::new(output));
    let notify_writer = Arc::clone(&writer);
    let session = ProxySession::new(
        Arc::clone(backend),
        Box::new(move |channel, message: Value| {
            let frame = Frame::new(FrameKind::Notify, channel, 0, message.encode());
            if let Err(e) = frame.write_to(&mut *notify_writer.lock()) {
                log::debug!("[PROXY] notify on channel {} failed: {}", channel, e);
            }
        }),
    );
    let sessions = Arc::clone(sessions);

    let spawned = thread::Builder::new()
        .name(format!("extend-proxy-{}", id))
        .spawn(move || {
            log::debug!("[PROXY] session {} from {:?}", id, remote);
            let mut input = input;
            serve(&session, &mut input, &writer, max_frame_size);
            session.close_all();
            if let Some((_, socket)) = sessions.remove(&id) {
                socket.close();
            }
            log::debug!("[PROXY] session {} ended", id);
        });
    if let Err(e) = spawned {
        log::warn!("[PROXY] could not spawn session thread: {}", e);
    }
}

fn serve(
    session: &ProxySession,
    input: &mut SocketStream,
    writer: &Mutex<SocketStream>,
    max_frame_size: usize,
) {
    loop {
        let frame = match Frame::read_from(input, max_frame_size) {
            Ok(frame) => frame,
            Err(Error::ConnectionClosed) => return,
            Err(e) => {
                log::debug!("[PROXY] read failed: {}", e);
                return;
            }
        };

        let reply = match frame.kind {
            FrameKind::OpenChannel => Some(control_reply(frame.body.as_slice(), |body| {
                let body = OpenChannelBody::decode(body)?;
                session.open_channel(body.protocol, body.subject)
            })),
            FrameKind::AcceptChannel => Some(control_reply(frame.body.as_slice(), |body| {
                let body = AcceptChannelBody::decode(body)?;
                let uri: ChannelUri = body.uri.parse()?;
                session.accept_channel(&uri, body.subject)
            })),
            FrameKind::CloseChannel => {
                session.close_channel(frame.channel);
                None
            }
            FrameKind::Request => Some(match Request::decode(&frame.body) {
                Ok(request) => session.handle(frame.channel, request),
                Err(e) => Response::from(Err(e)),
            }),
            other => {
                log::debug!("[PROXY] unexpected {:?} frame from client", other);
                None
            }
        };

        if let Some(response) = reply {
            let channel = match frame.kind {
                FrameKind::Request => frame.channel,
                _ => CONTROL_CHANNEL,
            };
            let out = Frame::new(FrameKind::Response, channel, frame.request, response.encode());
            if let Err(e) = out.write_to(&mut *writer.lock()) {
                log::debug!("[PROXY] write failed: {}", e);
                return;
            }
        }
    }
}

fn control_reply<F>(body: &[u8], op: F) -> Response
where
    F: FnOnce(&[u8]) -> Result<u32>,
{
    op(body).map(Value::from).into()
}
