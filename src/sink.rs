// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Segments and the listener fan-out.
//!
//! Every unit of activity a leg observes becomes a [`Segment`] published to
//! the leg's [`SinkSet`]. Delivery is synchronous on the publishing leg's
//! task and in registration order, so a slow sink exerts direct backpressure
//! on that leg and, through the peer forwarder, on the whole session.
//!
//! The built-in sinks mirror the proxy's cross-wiring: [`SegmentSink::ClientUpdater`]
//! re-serializes inbound client messages toward the upstream server,
//! [`SegmentSink::ServerUpdater`] does the reverse, and
//! [`SegmentSink::Recorder`] appends the wire form of every message to the
//! session recording. Forwarding re-serializes through the wire codec rather
//! than tunneling raw bytes, which leaves room to drop or rewrite messages.

use std::sync::Arc;

use bytes::BytesMut;

use crate::connection::ConnState;
use crate::error::Result;
use crate::protocol::{ClientMessage, Rectangle, ServerMessage};
use crate::recorder::{LegTag, Recorder};

/// One unit of observable activity on a leg, delivered to its sinks.
#[derive(Debug, Clone)]
pub enum Segment {
    /// A fully parsed client-to-server message.
    ClientMessage(ClientMessage),
    /// A fully parsed server-to-client message.
    ServerMessage(ServerMessage),
    /// A single framebuffer rectangle, for interceptors that want updates at
    /// sub-message granularity. Not a complete wire message on its own.
    Rectangle(Rectangle),
    /// Raw bytes to pass through unchanged.
    Bytes(Vec<u8>),
    /// The leg's transport has closed; no further segments will follow.
    ConnectionClosed,
}

impl Segment {
    /// The complete wire form of this segment, if it has one.
    ///
    /// `Rectangle` and `ConnectionClosed` yield nothing: the former travels
    /// inside its `FramebufferUpdate`, the latter has no wire form.
    fn wire_bytes(&self) -> Option<BytesMut> {
        match self {
            Segment::ClientMessage(message) => {
                let mut buf = BytesMut::new();
                message.write_to(&mut buf);
                Some(buf)
            }
            Segment::ServerMessage(message) => {
                let mut buf = BytesMut::new();
                message.write_to(&mut buf);
                Some(buf)
            }
            Segment::Bytes(bytes) => Some(BytesMut::from(&bytes[..])),
            Segment::Rectangle(_) | Segment::ConnectionClosed => None,
        }
    }
}

/// A consumer of segments.
pub enum SegmentSink {
    /// Forwards segments from the inbound leg to the upstream server leg.
    ClientUpdater(Arc<ConnState>),
    /// Forwards segments from the upstream leg back to the inbound client leg.
    ServerUpdater(Arc<ConnState>),
    /// Appends every observed segment to a session recording with the given
    /// leg tag.
    Recorder(Arc<Recorder>, LegTag),
    /// Test-only sink recording delivery order.
    #[cfg(test)]
    Probe(probe::Probe),
}

impl SegmentSink {
    /// Delivers one segment to this sink.
    pub async fn consume(&self, segment: &Segment) -> Result<()> {
        match self {
            SegmentSink::ClientUpdater(state) | SegmentSink::ServerUpdater(state) => {
                forward(state, segment).await
            }
            SegmentSink::Recorder(recorder, leg) => {
                if let Some(bytes) = segment.wire_bytes() {
                    recorder.record(*leg, &bytes).await?;
                }
                Ok(())
            }
            #[cfg(test)]
            SegmentSink::Probe(probe) => probe.consume(segment),
        }
    }
}

/// Re-serializes a segment onto the peer leg's socket.
///
/// Pixel-format and encoding changes are applied to the peer leg before the
/// bytes go out: the upstream server interprets everything after a forwarded
/// `SetPixelFormat` in the new format, so the parsing leg has to as well.
async fn forward(state: &ConnState, segment: &Segment) -> Result<()> {
    match segment {
        Segment::ClientMessage(message) => state.apply_client_message(message).await,
        Segment::ServerMessage(message) => state.apply_server_message(message).await,
        _ => {}
    }
    if let Some(bytes) = segment.wire_bytes() {
        state.write_frame(&bytes).await?;
    }
    Ok(())
}

/// An ordered collection of sinks fed by one leg.
///
/// Sinks are added during session setup, before the leg's run loop starts;
/// registration and delivery never run concurrently.
#[derive(Default)]
pub struct SinkSet {
    sinks: Vec<SegmentSink>,
}

impl SinkSet {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a sink; it will receive segments after all earlier sinks.
    pub fn add(&mut self, sink: SegmentSink) {
        self.sinks.push(sink);
    }

    /// Delivers a segment to every sink in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first sink error; later sinks are not invoked for this
    /// segment.
    pub async fn consume(&self, segment: &Segment) -> Result<()> {
        for sink in &self.sinks {
            sink.consume(segment).await?;
        }
        Ok(())
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sinks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}
