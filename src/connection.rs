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

//! Shared per-leg connection state.
//!
//! Each proxy leg splits its transport into a read half owned by the leg's
//! run loop and a write half held here behind a mutex, so a peer-leg
//! forwarder sink and a locally generated write can never interleave bytes
//! on the wire. The rest of the state (pixel format, colour map, encodings,
//! desktop geometry) is display metadata that decoders depend on; it is
//! mutated only at message boundaries and read as consistent snapshots.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::encoding::Encoding;
use crate::error::Result;
use crate::protocol::{ClientMessage, ColourMap, PixelFormat, ProtoVersion, ServerMessage};

/// Type-erased read half of a leg's transport.
pub(crate) type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// Type-erased write half of a leg's transport.
pub(crate) type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between a leg's run loop and the sinks that write to it.
///
/// A [`ConnState`] is created per leg during the handshake and handed to the
/// peer leg's forwarder sink as a relation, not an ownership transfer; the
/// session tears both legs down together.
pub struct ConnState {
    writer: Mutex<BoxWriter>,
    pixel_format: RwLock<PixelFormat>,
    colour_map: RwLock<ColourMap>,
    /// Active encodings, peer preference order intersected with `supported`.
    encodings: RwLock<Vec<Encoding>>,
    /// Capabilities registered at construction. Never changes afterwards.
    supported: Vec<Encoding>,
    width: AtomicU16,
    height: AtomicU16,
    desktop_name: RwLock<String>,
    version: RwLock<ProtoVersion>,
    session_id: RwLock<String>,
}

impl ConnState {
    pub(crate) fn new(
        writer: BoxWriter,
        pixel_format: PixelFormat,
        supported: Vec<Encoding>,
        width: u16,
        height: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            writer: Mutex::new(writer),
            pixel_format: RwLock::new(pixel_format),
            colour_map: RwLock::new(ColourMap::default()),
            encodings: RwLock::new(Vec::new()),
            supported,
            width: AtomicU16::new(width),
            height: AtomicU16::new(height),
            desktop_name: RwLock::new(String::new()),
            version: RwLock::new(ProtoVersion::Rfb38),
            session_id: RwLock::new(String::new()),
        })
    }

    /// Writes one complete wire frame under the leg's write lock.
    pub async fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shuts down the write half, unblocking the peer's pending read.
    pub async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Snapshot of the leg's current pixel format.
    pub async fn pixel_format(&self) -> PixelFormat {
        self.pixel_format.read().await.clone()
    }

    /// Installs a new pixel format.
    ///
    /// A colour-mapped format invalidates any previously installed palette;
    /// the peer has to send fresh `SetColourMapEntries` before indexed pixels
    /// mean anything again.
    pub async fn set_pixel_format(&self, format: PixelFormat) {
        let colour_mapped = format.true_colour_flag == 0;
        *self.pixel_format.write().await = format;
        if colour_mapped {
            *self.colour_map.write().await = ColourMap::default();
        }
    }

    /// Snapshot of the leg's current colour map.
    pub async fn colour_map(&self) -> ColourMap {
        self.colour_map.read().await.clone()
    }

    /// Replaces the leg's colour map.
    pub async fn set_colour_map(&self, map: ColourMap) {
        *self.colour_map.write().await = map;
    }

    /// Snapshot of the active encodings in peer preference order.
    pub async fn encodings(&self) -> Vec<Encoding> {
        self.encodings.read().await.clone()
    }

    /// Replaces the active encodings with the peer's requested list
    /// intersected with the registered capabilities, preserving the peer's
    /// order. The previous list is discarded.
    pub async fn set_encodings(&self, requested: &[i32]) {
        let active: Vec<Encoding> = requested
            .iter()
            .filter_map(|&encoding_type| {
                self.supported
                    .iter()
                    .copied()
                    .find(|e| e.encoding_type() == encoding_type)
            })
            .collect();
        *self.encodings.write().await = active;
    }

    /// The capabilities this leg was configured with.
    pub fn supported(&self) -> &[Encoding] {
        &self.supported
    }

    /// Current framebuffer width in pixels.
    pub fn width(&self) -> u16 {
        self.width.load(Ordering::Relaxed)
    }

    /// Current framebuffer height in pixels.
    pub fn height(&self) -> u16 {
        self.height.load(Ordering::Relaxed)
    }

    pub(crate) fn set_size(&self, width: u16, height: u16) {
        self.width.store(width, Ordering::Relaxed);
        self.height.store(height, Ordering::Relaxed);
    }

    /// The desktop name announced in `ServerInit`.
    pub async fn desktop_name(&self) -> String {
        self.desktop_name.read().await.clone()
    }

    pub(crate) async fn set_desktop_name(&self, name: String) {
        *self.desktop_name.write().await = name;
    }

    /// The protocol version negotiated on this leg.
    pub async fn version(&self) -> ProtoVersion {
        *self.version.read().await
    }

    pub(crate) async fn set_version(&self, version: ProtoVersion) {
        *self.version.write().await = version;
    }

    /// The session this leg belongs to.
    pub async fn session_id(&self) -> String {
        self.session_id.read().await.clone()
    }

    pub(crate) async fn set_session_id(&self, session_id: String) {
        *self.session_id.write().await = session_id;
    }

    /// Applies the state changes a client message implies for the leg that
    /// processes it: pixel format replacement and encoding list updates.
    pub(crate) async fn apply_client_message(&self, message: &ClientMessage) {
        match message {
            ClientMessage::SetPixelFormat(format) => {
                self.set_pixel_format(format.clone()).await;
            }
            ClientMessage::SetEncodings(requested) => {
                self.set_encodings(requested).await;
            }
            _ => {}
        }
    }

    /// Applies the state changes a server message implies for the leg that
    /// processes it: colour map replacement.
    pub(crate) async fn apply_server_message(&self, message: &ServerMessage) {
        if let ServerMessage::SetColourMapEntries(map) = message {
            self.set_colour_map(map.clone()).await;
        }
    }
}
