// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Message model and wire encoding shared by client and proxy.

mod codec;
mod discovery;
mod message;
mod uri;
mod value;

pub use codec::{
    AcceptChannelBody, Frame, FrameKind, OpenChannelBody, CONTROL_CHANNEL, DEFAULT_MAX_FRAME_SIZE,
    FRAME_HEADER_SIZE,
};
pub use discovery::{
    LookupReply, LookupRequest, LookupStatus, DISCOVERY_MAGIC, DISCOVERY_VERSION, MAX_DATAGRAM_SIZE,
};
pub use message::{failure_code, type_id, MessageFactory, Protocol, Request, Response};
pub use uri::ChannelUri;
pub use value::Value;
