// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multiplexed connection over one [`TcpSocket`].
//!
//! Writers serialize on one output stream. A reader thread decodes frames
//! and routes responses to waiting callers through a pending-request table
//! keyed by request id; pushed `Notify` frames go to the channel's
//! [`Receiver`].
//!
//! When the reader hits EOF or an I/O error while the connection is still
//! open, every pending request fails with [`Error::ConnectionClosed`] and the
//! listener is told about the loss.

use super::{next_connection_id, report_loss, Channel, Connection, ConnectionListener, Receiver};
use crate::error::{Error, Result};
use crate::net::{duration_to_ms, SocketStream, TcpSocket};
use crate::protocol::{
    AcceptChannelBody, ChannelUri, Frame, FrameKind, MessageFactory, OpenChannelBody, Protocol,
    Request, Response, Value, CONTROL_CHANNEL,
};
use crate::service::Subject;
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

type Pending = DashMap<u64, Sender<Result<Response>>>;

/// Client side of a multiplexed TCP connection.
pub struct TcpConnection {
    shared: Arc<Shared>,
    reader: Mutex<Option<thread::JoinHandle<()>>>,
}

struct Shared {
    id: u64,
    socket: TcpSocket,
    writer: Mutex<SocketStream>,
    pending: Pending,
    next_request: AtomicU64,
    channels: DashMap<u32, Arc<TcpChannel>>,
    open: AtomicBool,
    listener: Weak<dyn ConnectionListener>,
    request_timeout: Option<Duration>,
    max_frame_size: usize,
}

impl TcpConnection {
    /// Take over a connected socket and start the reader thread.
    pub fn start(
        socket: TcpSocket,
        listener: Weak<dyn ConnectionListener>,
        request_timeout: Option<Duration>,
        max_frame_size: usize,
    ) -> Result<Self> {
        let writer = socket.output_stream()?;
        let mut input = socket.input_stream()?;
        let shared = Arc::new(Shared {
            id: next_connection_id(),
            socket,
            writer: Mutex::new(writer),
            pending: DashMap::new(),
            next_request: AtomicU64::new(1),
            channels: DashMap::new(),
            open: AtomicBool::new(true),
            listener,
            request_timeout,
            max_frame_size,
        });

        let reader = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name(format!("extend-conn-{}", shared.id))
                .spawn(move || shared.read_loop(&mut input))?
        };

        log::debug!(
            "[TCP] connection {} established to {:?}",
            shared.id,
            shared.socket.remote_address()
        );
        Ok(Self {
            shared,
            reader: Mutex::new(Some(reader)),
        })
    }

    /// Requests waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    fn control(&self, kind: FrameKind, body: Vec<u8>, operation: &str) -> Result<u32> {
        let value = self
            .shared
            .call(kind, CONTROL_CHANNEL, body, operation)?
            .into_result()?;
        let id = value.expect_int("channel id")?;
        u32::try_from(id).map_err(|_| Error::protocol(format!("channel id {} out of range", id)))
    }

    fn register(
        &self,
        id: u32,
        protocol: Protocol,
        receiver: Option<Arc<dyn Receiver>>,
    ) -> Arc<dyn Channel> {
        let channel = Arc::new(TcpChannel {
            id,
            factory: MessageFactory::new(protocol),
            open: AtomicBool::new(true),
            receiver,
            connection: Arc::downgrade(&self.shared),
        });
        self.shared.channels.insert(id, Arc::clone(&channel));
        channel
    }
}

impl Shared {
    fn write(&self, frame: &Frame) -> Result<()> {
        let mut writer = self.writer.lock();
        frame.write_to(&mut *writer)?;
        Ok(())
    }

    /// Send a frame and wait for the matching response.
    fn call(&self, kind: FrameKind, channel: u32, body: Vec<u8>, operation: &str) -> Result<Response> {
        if !self.open.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.pending.insert(request_id, tx);

        if let Err(e) = self.write(&Frame::new(kind, channel, request_id, body)) {
            self.pending.remove(&request_id);
            return Err(e);
        }

        let outcome = match self.request_timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => Error::RequestTimeout {
                    operation: operation.to_string(),
                    timeout_ms: duration_to_ms(timeout),
                },
                RecvTimeoutError::Disconnected => Error::ConnectionClosed,
            }),
            None => rx.recv().map_err(|_| Error::ConnectionClosed),
        };
        if outcome.is_err() {
            self.pending.remove(&request_id);
        }
        outcome?
    }

    fn read_loop(&self, input: &mut SocketStream) {
        let failure = loop {
            match Frame::read_from(input, self.max_frame_size) {
                Ok(frame) => self.dispatch(frame),
                Err(e) => break e,
            }
        };

        if self.shutdown() {
            match failure {
                Error::ConnectionClosed => report_loss(&self.listener, self.id, None),
                e => report_loss(&self.listener, self.id, Some(&e)),
            }
        } else {
            log::trace!("[TCP] connection {} reader exiting", self.id);
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame.kind {
            FrameKind::Response => match self.pending.remove(&frame.request) {
                Some((_, tx)) => {
                    let _ = tx.send(Response::decode(&frame.body));
                }
                None => log::debug!(
                    "[TCP] connection {} dropped late response {}",
                    self.id,
                    frame.request
                ),
            },
            FrameKind::Notify => {
                let receiver = self
                    .channels
                    .get(&frame.channel)
                    .and_then(|c| c.receiver.clone());
                match (receiver, Value::decode(&frame.body)) {
                    (Some(receiver), Ok(message)) => receiver.on_message(frame.channel, message),
                    (None, _) => log::trace!("[TCP] notify for channel {} without receiver", frame.channel),
                    (_, Err(e)) => log::debug!("[TCP] bad notify on channel {}: {}", frame.channel, e),
                }
            }
            FrameKind::CloseChannel => {
                if let Some((_, channel)) = self.channels.remove(&frame.channel) {
                    channel.mark_closed();
                }
            }
            other => log::debug!(
                "[TCP] connection {} ignoring unexpected {:?} frame",
                self.id,
                other
            ),
        }
    }

    /// Close the socket, fail pending requests, close channels.
    /// Returns false if the connection was already shut down.
    fn shutdown(&self) -> bool {
        if !self.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.socket.close();

        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(Error::ConnectionClosed));
            }
        }

        let channels: Vec<Arc<TcpChannel>> =
            self.channels.iter().map(|c| Arc::clone(c.value())).collect();
        self.channels.clear();
        for channel in channels {
            channel.mark_closed();
        }
        true
    }
}

impl Connection for TcpConnection {
    fn id(&self) -> u64 {
        self.shared.id
    }

    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn open_channel(
        &self,
        protocol: Protocol,
        name: &str,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>> {
        let body = OpenChannelBody {
            protocol,
            name: name.to_string(),
            subject: subject.map(|s| s.principal().to_string()),
        };
        let id = self.control(FrameKind::OpenChannel, body.encode(), "OpenChannel")?;
        log::debug!(
            "[TCP] connection {} opened {} channel {}",
            self.shared.id,
            protocol,
            id
        );
        Ok(self.register(id, protocol, receiver))
    }

    fn accept_channel(
        &self,
        uri: &ChannelUri,
        receiver: Option<Arc<dyn Receiver>>,
        subject: Option<&Subject>,
    ) -> Result<Arc<dyn Channel>> {
        let body = AcceptChannelBody {
            uri: uri.to_string(),
            subject: subject.map(|s| s.principal().to_string()),
        };
        let id = self.control(FrameKind::AcceptChannel, body.encode(), "AcceptChannel")?;
        Ok(self.register(id, uri.protocol, receiver))
    }

    fn close(&self) -> Result<()> {
        if self.shared.shutdown() {
            log::debug!("[TCP] connection {} closed", self.shared.id);
        }
        if let Some(reader) = self.reader.lock().take() {
            if reader.thread().id() != thread::current().id() && reader.join().is_err() {
                log::debug!("[TCP] connection {} reader panicked", self.shared.id);
            }
        }
        Ok(())
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

struct TcpChannel {
    id: u32,
    factory: MessageFactory,
    open: AtomicBool,
    receiver: Option<Arc<dyn Receiver>>,
    connection: Weak<Shared>,
}

impl TcpChannel {
    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            if let Some(receiver) = &self.receiver {
                receiver.on_channel_closed(self.id);
            }
        }
    }
}

impl Channel for TcpChannel {
    fn id(&self) -> u32 {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn message_factory(&self) -> MessageFactory {
        self.factory
    }

    fn request(&self, request: Request) -> Result<Value> {
        let shared = self.connection.upgrade().ok_or(Error::ConnectionClosed)?;
        if !self.is_open() {
            return Err(Error::InvalidState(format!("channel {} is closed", self.id)));
        }
        if !self.factory.accepts(&request) {
            return Err(Error::protocol(format!(
                "{} request on {} channel",
                request.protocol(),
                self.factory.protocol()
            )));
        }
        let operation = request.operation();
        shared
            .call(FrameKind::Request, self.id, request.encode(), operation)?
            .into_result()
    }

    fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let Some(shared) = self.connection.upgrade() else {
            return Ok(());
        };
        shared.channels.remove(&self.id);
        if !shared.open.load(Ordering::Acquire) {
            return Ok(());
        }
        shared.write(&Frame::new(FrameKind::CloseChannel, self.id, 0, Vec::new()))
    }
}
