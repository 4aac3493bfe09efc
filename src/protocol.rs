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

//! VNC Remote Framebuffer (RFB) protocol constants and typed messages.
//!
//! This module provides the wire codec shared by both proxy legs: protocol
//! version negotiation, security constants, pixel formats, and the typed
//! client-to-server and server-to-client message layer as specified in
//! RFC 6143.
//!
//! # Framing Model
//!
//! Every RFB message starts with a one-byte message type. The per-leg run
//! loop consumes that byte and dispatches into [`ClientMessage::read_from`]
//! or [`ServerMessage::read_from`], which parse the remainder of the message
//! from the stream. Serialization goes the other way: [`ClientMessage::write_to`]
//! and [`ServerMessage::write_to`] emit the type byte first, then the body,
//! into a [`BytesMut`] that is written to the socket in one guarded write.
//! Parsing and re-serializing a message reproduces its original wire form,
//! which is what the recorder and the peer-leg forwarders rely on.

use bytes::{BufMut, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::encoding::Encoding;
use crate::error::{ProxyError, Result};

/// Upper bound for any u32-length-prefixed field read off the wire.
///
/// Lengths above this are treated as malformed rather than allocated.
pub(crate) const MAX_BLOB_LEN: usize = 16 * 1024 * 1024;

// Client-to-Server Message Types

/// Message type: client requests a new pixel format.
pub const CLIENT_MSG_SET_PIXEL_FORMAT: u8 = 0;

/// Message type: client lists the encodings it supports, in preference order.
pub const CLIENT_MSG_SET_ENCODINGS: u8 = 2;

/// Message type: client requests a framebuffer update for a region.
pub const CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST: u8 = 3;

/// Message type: client sends a keyboard event.
pub const CLIENT_MSG_KEY_EVENT: u8 = 4;

/// Message type: client sends a pointer (mouse) event.
pub const CLIENT_MSG_POINTER_EVENT: u8 = 5;

/// Message type: client sends cut text (clipboard data).
pub const CLIENT_MSG_CLIENT_CUT_TEXT: u8 = 6;

/// Message type: QEMU client extension messages (submessage byte follows).
pub const CLIENT_MSG_QEMU: u8 = 255;

// Server-to-Client Message Types

/// Message type: server sends a framebuffer update.
pub const SERVER_MSG_FRAMEBUFFER_UPDATE: u8 = 0;

/// Message type: server sets colour map entries for indexed colour modes.
pub const SERVER_MSG_SET_COLOUR_MAP_ENTRIES: u8 = 1;

/// Message type: server rings the bell.
pub const SERVER_MSG_BELL: u8 = 2;

/// Message type: server sends cut text (clipboard data).
pub const SERVER_MSG_SERVER_CUT_TEXT: u8 = 3;

// Security Types

/// Security type: invalid/unknown. On RFB 3.3 this announces a refusal.
pub const SECURITY_TYPE_INVALID: u8 = 0;

/// Security type: no authentication.
pub const SECURITY_TYPE_NONE: u8 = 1;

/// Security type: VNC authentication (DES challenge-response).
pub const SECURITY_TYPE_VNC_AUTH: u8 = 2;

// Security Results

/// Security result: authentication successful.
pub const SECURITY_RESULT_OK: u32 = 0;

/// Security result: authentication failed.
pub const SECURITY_RESULT_FAILED: u32 = 1;

// Encoding Types

/// Encoding type: raw pixel data.
pub const ENCODING_RAW: i32 = 0;

/// Encoding type: copy rectangle.
pub const ENCODING_COPYRECT: i32 = 1;

/// Encoding type: Rise-and-Run-length Encoding.
pub const ENCODING_RRE: i32 = 2;

/// Encoding type: compact RRE.
pub const ENCODING_CORRE: i32 = 4;

/// Encoding type: Hextile (16x16 tiles with per-tile subencoding).
pub const ENCODING_HEXTILE: i32 = 5;

/// Encoding type: zlib-compressed raw data.
pub const ENCODING_ZLIB: i32 = 6;

/// Encoding type: Tight.
pub const ENCODING_TIGHT: i32 = 7;

/// Encoding type: Zlib Run-Length Encoding.
pub const ENCODING_ZRLE: i32 = 16;

/// Encoding type: `TightPng` (Tight with PNG instead of JPEG).
pub const ENCODING_TIGHTPNG: i32 = -260;

/// Pseudo-encoding: rich cursor shape updates.
pub const ENCODING_CURSOR: i32 = -239;

/// Pseudo-encoding: keyboard LED state.
pub const ENCODING_LED_STATE: i32 = -261;

// Hextile subencoding flags

/// Hextile: raw pixel data for this tile.
pub const HEXTILE_RAW: u8 = 1 << 0;

/// Hextile: background colour is specified.
pub const HEXTILE_BACKGROUND_SPECIFIED: u8 = 1 << 1;

/// Hextile: foreground colour is specified.
pub const HEXTILE_FOREGROUND_SPECIFIED: u8 = 1 << 2;

/// Hextile: tile contains subrectangles.
pub const HEXTILE_ANY_SUBRECTS: u8 = 1 << 3;

/// Hextile: subrectangles carry their own colour.
pub const HEXTILE_SUBRECTS_COLOURED: u8 = 1 << 4;

/// Maps an end-of-stream I/O error to a truncation error for a field that
/// may legally only be missing if the message was cut short mid-body.
pub(crate) fn truncated(err: io::Error, what: &'static str) -> ProxyError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProxyError::Truncated(what)
    } else {
        ProxyError::Io(err)
    }
}

/// Reads a u32-length-prefixed byte blob, bounded by [`MAX_BLOB_LEN`].
async fn read_blob<R: AsyncRead + Unpin>(
    reader: &mut R,
    what: &'static str,
) -> Result<Vec<u8>> {
    let length = reader.read_u32().await.map_err(|e| truncated(e, what))? as usize;
    if length > MAX_BLOB_LEN {
        return Err(ProxyError::Protocol(format!(
            "{what} length {length} exceeds limit"
        )));
    }
    let mut data = vec![0u8; length];
    reader
        .read_exact(&mut data)
        .await
        .map_err(|e| truncated(e, what))?;
    Ok(data)
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Negotiated RFB protocol version.
///
/// The proxy offers 3.8 on the inbound leg and answers whatever the
/// upstream server announces on the outbound leg, so all three published
/// versions can be in play at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoVersion {
    /// RFB 3.3: server dictates the security type, no security result for None.
    Rfb33,
    /// RFB 3.7: security type list, no security result for None.
    Rfb37,
    /// RFB 3.8: security type list and mandatory security result.
    Rfb38,
}

impl ProtoVersion {
    /// Reads the 12-byte version string from the stream.
    ///
    /// Apple Remote Desktop announces "RFB 003.889" and speaks 3.8 on the
    /// wire, so it maps to [`ProtoVersion::Rfb38`].
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for any other version string and
    /// [`ProxyError::Io`] on transport failure.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 12];
        reader.read_exact(&mut buf).await?;
        match &buf {
            b"RFB 003.003\n" => Ok(ProtoVersion::Rfb33),
            b"RFB 003.007\n" => Ok(ProtoVersion::Rfb37),
            b"RFB 003.008\n" => Ok(ProtoVersion::Rfb38),
            b"RFB 003.889\n" => Ok(ProtoVersion::Rfb38),
            other => Err(ProxyError::Protocol(format!(
                "unsupported protocol version {:?}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    /// Serializes the 12-byte version string.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_slice(self.as_str().as_bytes());
    }

    /// The exact 12-byte wire form, including the trailing newline.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtoVersion::Rfb33 => "RFB 003.003\n",
            ProtoVersion::Rfb37 => "RFB 003.007\n",
            ProtoVersion::Rfb38 => "RFB 003.008\n",
        }
    }
}

/// Represents the pixel format of a framebuffer.
///
/// This struct defines how pixel data is interpreted, including colour depth,
/// endianness, and RGB component details. Its 16-byte wire form appears in
/// `SetPixelFormat` and `ServerInit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelFormat {
    /// Number of bits per pixel.
    pub bits_per_pixel: u8,
    /// Depth of the pixel in bits.
    pub depth: u8,
    /// Flag indicating if the pixel data is big-endian (1) or little-endian (0).
    pub big_endian_flag: u8,
    /// Flag indicating if the pixel format is true-colour (1) or colour-mapped (0).
    pub true_colour_flag: u8,
    /// Maximum red colour value.
    pub red_max: u16,
    /// Maximum green colour value.
    pub green_max: u16,
    /// Maximum blue colour value.
    pub blue_max: u16,
    /// Number of shifts to apply to get the red colour component.
    pub red_shift: u8,
    /// Number of shifts to apply to get the green colour component.
    pub green_shift: u8,
    /// Number of shifts to apply to get the blue colour component.
    pub blue_shift: u8,
}

impl PixelFormat {
    /// Creates a standard 32-bit RGBA pixel format.
    #[must_use]
    pub fn rgba32() -> Self {
        Self {
            bits_per_pixel: 32,
            depth: 24,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 255,
            green_max: 255,
            blue_max: 255,
            red_shift: 0,
            green_shift: 8,
            blue_shift: 16,
        }
    }

    /// Whole bytes occupied by one pixel in this format.
    #[must_use]
    pub fn bytes_per_pixel(&self) -> usize {
        usize::from(self.bits_per_pixel) / 8
    }

    /// Checks whether the format is one the proxy can frame payloads for.
    ///
    /// Rectangle payload sizes are computed from bits-per-pixel, so only
    /// whole-byte formats with a plausible depth are accepted.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self.bits_per_pixel, 8 | 16 | 32) && self.depth > 0 && self.depth <= 32
    }

    /// Writes the 16-byte pixel format blob into a buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.bits_per_pixel);
        buf.put_u8(self.depth);
        buf.put_u8(self.big_endian_flag);
        buf.put_u8(self.true_colour_flag);
        buf.put_u16(self.red_max);
        buf.put_u16(self.green_max);
        buf.put_u16(self.blue_max);
        buf.put_u8(self.red_shift);
        buf.put_u8(self.green_shift);
        buf.put_u8(self.blue_shift);
        buf.put_bytes(0, 3); // padding
    }

    /// Reads the 16-byte pixel format blob from the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Truncated`] if the stream ends mid-blob.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut raw = [0u8; 16];
        reader
            .read_exact(&mut raw)
            .await
            .map_err(|e| truncated(e, "pixel format"))?;
        Ok(Self {
            bits_per_pixel: raw[0],
            depth: raw[1],
            big_endian_flag: raw[2],
            true_colour_flag: raw[3],
            red_max: u16::from_be_bytes([raw[4], raw[5]]),
            green_max: u16::from_be_bytes([raw[6], raw[7]]),
            blue_max: u16::from_be_bytes([raw[8], raw[9]]),
            red_shift: raw[10],
            green_shift: raw[11],
            blue_shift: raw[12],
            // raw[13..16] is padding
        })
    }
}

/// One RGB palette entry with 16-bit channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Colour {
    /// Red channel intensity.
    pub red: u16,
    /// Green channel intensity.
    pub green: u16,
    /// Blue channel intensity.
    pub blue: u16,
}

/// Palette installed by `SetColourMapEntries` for colour-mapped formats.
///
/// Only meaningful while the leg's pixel format has true-colour = 0; any
/// pixel format change replaces the map with an empty one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColourMap {
    /// Index of the first palette entry covered by `colours`.
    pub first_colour: u16,
    /// Consecutive palette entries starting at `first_colour`.
    pub colours: Vec<Colour>,
}

/// The one-byte `ClientInit` message ending the client side of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientInit {
    /// Whether the client asks to share the desktop with other clients.
    pub shared: bool,
}

impl ClientInit {
    /// Reads the shared flag byte.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        Ok(Self {
            shared: reader.read_u8().await? != 0,
        })
    }

    /// Serializes the shared flag byte.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(u8::from(self.shared));
    }
}

/// Represents the `ServerInit` message sent at the end of the handshake.
///
/// It provides the client with framebuffer dimensions, pixel format, and
/// the desktop name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInit {
    /// The width of the framebuffer in pixels.
    pub framebuffer_width: u16,
    /// The height of the framebuffer in pixels.
    pub framebuffer_height: u16,
    /// The pixel format used by the framebuffer.
    pub pixel_format: PixelFormat,
    /// The name of the desktop.
    pub name: String,
}

impl ServerInit {
    /// Serializes the `ServerInit` message into a byte buffer.
    ///
    /// The format follows the RFB protocol specification:
    /// - 2 bytes: framebuffer width
    /// - 2 bytes: framebuffer height
    /// - 16 bytes: pixel format
    /// - 4 bytes: name length
    /// - N bytes: name string
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.framebuffer_width);
        buf.put_u16(self.framebuffer_height);
        self.pixel_format.write_to(buf);
        put_blob(buf, self.name.as_bytes());
    }

    /// Reads a `ServerInit` message from the stream.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] when the name length is out of range
    /// and [`ProxyError::Truncated`] when the stream ends mid-message.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let framebuffer_width = reader.read_u16().await?;
        let framebuffer_height = reader.read_u16().await?;
        let pixel_format = PixelFormat::read_from(reader).await?;
        let name_bytes = read_blob(reader, "desktop name").await?;
        Ok(Self {
            framebuffer_width,
            framebuffer_height,
            pixel_format,
            name: String::from_utf8_lossy(&name_bytes).into_owned(),
        })
    }
}

/// One rectangle of a `FramebufferUpdate`.
///
/// The payload is the verbatim wire form for the rectangle's encoding. The
/// proxy frames it with the matching [`Encoding`] capability but never
/// decodes the pixels inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rectangle {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width of the rectangle in pixels.
    pub width: u16,
    /// Height of the rectangle in pixels.
    pub height: u16,
    /// The encoding type used for this rectangle's payload.
    pub encoding: i32,
    /// The undecoded payload bytes, exactly as read off the wire.
    pub payload: Vec<u8>,
}

impl Rectangle {
    /// Writes the rectangle header and payload to a byte buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u16(self.x);
        buf.put_u16(self.y);
        buf.put_u16(self.width);
        buf.put_u16(self.height);
        buf.put_i32(self.encoding);
        buf.put_slice(&self.payload);
    }

    /// Reads one rectangle: the 12-byte header, then the payload framed by
    /// the capability registered for the announced encoding type.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] when no capability covers the
    /// announced encoding type, since the payload length would be unknowable.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        pixel_format: &PixelFormat,
        encodings: &[Encoding],
    ) -> Result<Self> {
        let x = reader.read_u16().await?;
        let y = reader.read_u16().await?;
        let width = reader.read_u16().await?;
        let height = reader.read_u16().await?;
        let encoding = reader.read_i32().await?;
        let capability = encodings
            .iter()
            .find(|e| e.encoding_type() == encoding)
            .ok_or_else(|| {
                ProxyError::Protocol(format!("no capability for encoding type {encoding}"))
            })?;
        let payload = capability
            .read_payload(reader, width, height, pixel_format)
            .await?;
        Ok(Self {
            x,
            y,
            width,
            height,
            encoding,
            payload,
        })
    }
}

/// Represents all message types a VNC client sends to a server.
///
/// The inbound leg parses these off the client socket; the outbound leg
/// re-serializes them toward the upstream server unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Client requests a specific pixel format for framebuffer updates.
    SetPixelFormat(PixelFormat),

    /// Client specifies the list of encodings it supports, most preferred
    /// first. Unknown types are carried through verbatim.
    SetEncodings(Vec<i32>),

    /// Client requests a framebuffer update for a specific region.
    FramebufferUpdateRequest {
        /// If true, only send changes since the last update.
        incremental: bool,
        /// X coordinate of the requested region.
        x: u16,
        /// Y coordinate of the requested region.
        y: u16,
        /// Width of the requested region.
        width: u16,
        /// Height of the requested region.
        height: u16,
    },

    /// Client sends a keyboard key event.
    KeyEvent {
        /// True if the key is pressed, false if released.
        down: bool,
        /// The X Window System keysym value of the key.
        key: u32,
    },

    /// Client sends a pointer (mouse) event.
    PointerEvent {
        /// Bitmask of currently pressed mouse buttons.
        button_mask: u8,
        /// X coordinate of the pointer.
        x: u16,
        /// Y coordinate of the pointer.
        y: u16,
    },

    /// Client sends clipboard data. Latin-1 bytes are carried raw so the
    /// forwarded and recorded forms stay byte-identical.
    ClientCutText(Vec<u8>),

    /// QEMU extended key event carrying both keysym and hardware keycode.
    QemuExtKeyEvent {
        /// Submessage type byte, forwarded as received.
        submessage: u8,
        /// Non-zero if the key is pressed.
        down: u16,
        /// The X Window System keysym value of the key.
        keysym: u32,
        /// The XT scan code of the key.
        keycode: u32,
    },
}

impl ClientMessage {
    /// The message type byte that introduces this message on the wire.
    #[must_use]
    pub fn message_type(&self) -> u8 {
        match self {
            ClientMessage::SetPixelFormat(_) => CLIENT_MSG_SET_PIXEL_FORMAT,
            ClientMessage::SetEncodings(_) => CLIENT_MSG_SET_ENCODINGS,
            ClientMessage::FramebufferUpdateRequest { .. } => {
                CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST
            }
            ClientMessage::KeyEvent { .. } => CLIENT_MSG_KEY_EVENT,
            ClientMessage::PointerEvent { .. } => CLIENT_MSG_POINTER_EVENT,
            ClientMessage::ClientCutText(_) => CLIENT_MSG_CLIENT_CUT_TEXT,
            ClientMessage::QemuExtKeyEvent { .. } => CLIENT_MSG_QEMU,
        }
    }

    /// Parses the body of a client message whose type byte was already
    /// consumed by the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for unknown message types,
    /// [`ProxyError::Truncated`] for messages cut short mid-body, and
    /// [`ProxyError::Io`] on transport failure.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        message_type: u8,
    ) -> Result<Self> {
        match message_type {
            CLIENT_MSG_SET_PIXEL_FORMAT => {
                reader
                    .read_exact(&mut [0u8; 3])
                    .await
                    .map_err(|e| truncated(e, "SetPixelFormat padding"))?;
                let format = PixelFormat::read_from(reader).await?;
                Ok(ClientMessage::SetPixelFormat(format))
            }
            CLIENT_MSG_SET_ENCODINGS => {
                reader
                    .read_exact(&mut [0u8; 1])
                    .await
                    .map_err(|e| truncated(e, "SetEncodings padding"))?;
                let count = reader
                    .read_u16()
                    .await
                    .map_err(|e| truncated(e, "SetEncodings count"))?;
                let mut encodings = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    let encoding = reader
                        .read_i32()
                        .await
                        .map_err(|e| truncated(e, "SetEncodings encoding list"))?;
                    encodings.push(encoding);
                }
                Ok(ClientMessage::SetEncodings(encodings))
            }
            CLIENT_MSG_FRAMEBUFFER_UPDATE_REQUEST => Ok(ClientMessage::FramebufferUpdateRequest {
                incremental: reader.read_u8().await? != 0,
                x: reader.read_u16().await?,
                y: reader.read_u16().await?,
                width: reader.read_u16().await?,
                height: reader.read_u16().await?,
            }),
            CLIENT_MSG_KEY_EVENT => {
                let down = reader.read_u8().await? != 0;
                reader
                    .read_exact(&mut [0u8; 2])
                    .await
                    .map_err(|e| truncated(e, "KeyEvent padding"))?;
                let key = reader.read_u32().await?;
                Ok(ClientMessage::KeyEvent { down, key })
            }
            CLIENT_MSG_POINTER_EVENT => Ok(ClientMessage::PointerEvent {
                button_mask: reader.read_u8().await?,
                x: reader.read_u16().await?,
                y: reader.read_u16().await?,
            }),
            CLIENT_MSG_CLIENT_CUT_TEXT => {
                reader
                    .read_exact(&mut [0u8; 3])
                    .await
                    .map_err(|e| truncated(e, "ClientCutText padding"))?;
                let text = read_blob(reader, "ClientCutText body").await?;
                Ok(ClientMessage::ClientCutText(text))
            }
            CLIENT_MSG_QEMU => {
                let submessage = reader.read_u8().await?;
                let down = reader.read_u16().await?;
                let keysym = reader.read_u32().await?;
                let keycode = reader.read_u32().await?;
                Ok(ClientMessage::QemuExtKeyEvent {
                    submessage,
                    down,
                    keysym,
                    keycode,
                })
            }
            other => Err(ProxyError::Protocol(format!(
                "unknown client message type: {other}"
            ))),
        }
    }

    /// Serializes the message, type byte first, into a byte buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type());
        match self {
            ClientMessage::SetPixelFormat(format) => {
                buf.put_bytes(0, 3); // padding
                format.write_to(buf);
            }
            ClientMessage::SetEncodings(encodings) => {
                buf.put_u8(0); // padding
                buf.put_u16(encodings.len() as u16);
                for encoding in encodings {
                    buf.put_i32(*encoding);
                }
            }
            ClientMessage::FramebufferUpdateRequest {
                incremental,
                x,
                y,
                width,
                height,
            } => {
                buf.put_u8(u8::from(*incremental));
                buf.put_u16(*x);
                buf.put_u16(*y);
                buf.put_u16(*width);
                buf.put_u16(*height);
            }
            ClientMessage::KeyEvent { down, key } => {
                buf.put_u8(u8::from(*down));
                buf.put_bytes(0, 2); // padding
                buf.put_u32(*key);
            }
            ClientMessage::PointerEvent { button_mask, x, y } => {
                buf.put_u8(*button_mask);
                buf.put_u16(*x);
                buf.put_u16(*y);
            }
            ClientMessage::ClientCutText(text) => {
                buf.put_bytes(0, 3); // padding
                put_blob(buf, text);
            }
            ClientMessage::QemuExtKeyEvent {
                submessage,
                down,
                keysym,
                keycode,
            } => {
                buf.put_u8(*submessage);
                buf.put_u16(*down);
                buf.put_u32(*keysym);
                buf.put_u32(*keycode);
            }
        }
    }
}

/// Represents all message types a VNC server sends to a client.
///
/// The outbound leg parses these off the upstream socket; the inbound leg
/// re-serializes them toward the connected client unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// One or more rectangles of framebuffer content.
    FramebufferUpdate(Vec<Rectangle>),

    /// Palette update for colour-mapped pixel formats.
    SetColourMapEntries(ColourMap),

    /// Audible bell.
    Bell,

    /// Clipboard data from the server, raw Latin-1 bytes.
    ServerCutText(Vec<u8>),
}

impl ServerMessage {
    /// The message type byte that introduces this message on the wire.
    #[must_use]
    pub fn message_type(&self) -> u8 {
        match self {
            ServerMessage::FramebufferUpdate(_) => SERVER_MSG_FRAMEBUFFER_UPDATE,
            ServerMessage::SetColourMapEntries(_) => SERVER_MSG_SET_COLOUR_MAP_ENTRIES,
            ServerMessage::Bell => SERVER_MSG_BELL,
            ServerMessage::ServerCutText(_) => SERVER_MSG_SERVER_CUT_TEXT,
        }
    }

    /// Parses the body of a server message whose type byte was already
    /// consumed by the dispatcher.
    ///
    /// `FramebufferUpdate` rectangles change meaning with the leg's pixel
    /// format and encoding capabilities, so the caller passes the current
    /// snapshot of both.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for unknown message types or
    /// rectangles with no registered capability, [`ProxyError::Truncated`]
    /// for messages cut short mid-body, and [`ProxyError::Io`] on transport
    /// failure.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
        message_type: u8,
        pixel_format: &PixelFormat,
        encodings: &[Encoding],
    ) -> Result<Self> {
        match message_type {
            SERVER_MSG_FRAMEBUFFER_UPDATE => {
                reader
                    .read_exact(&mut [0u8; 1])
                    .await
                    .map_err(|e| truncated(e, "FramebufferUpdate padding"))?;
                let count = reader
                    .read_u16()
                    .await
                    .map_err(|e| truncated(e, "FramebufferUpdate count"))?;
                let mut rectangles = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    rectangles.push(Rectangle::read_from(reader, pixel_format, encodings).await?);
                }
                Ok(ServerMessage::FramebufferUpdate(rectangles))
            }
            SERVER_MSG_SET_COLOUR_MAP_ENTRIES => {
                reader
                    .read_exact(&mut [0u8; 1])
                    .await
                    .map_err(|e| truncated(e, "SetColourMapEntries padding"))?;
                let first_colour = reader.read_u16().await?;
                let count = reader
                    .read_u16()
                    .await
                    .map_err(|e| truncated(e, "SetColourMapEntries count"))?;
                let mut colours = Vec::with_capacity(usize::from(count));
                for _ in 0..count {
                    colours.push(Colour {
                        red: reader
                            .read_u16()
                            .await
                            .map_err(|e| truncated(e, "SetColourMapEntries colour"))?,
                        green: reader
                            .read_u16()
                            .await
                            .map_err(|e| truncated(e, "SetColourMapEntries colour"))?,
                        blue: reader
                            .read_u16()
                            .await
                            .map_err(|e| truncated(e, "SetColourMapEntries colour"))?,
                    });
                }
                Ok(ServerMessage::SetColourMapEntries(ColourMap {
                    first_colour,
                    colours,
                }))
            }
            SERVER_MSG_BELL => Ok(ServerMessage::Bell),
            SERVER_MSG_SERVER_CUT_TEXT => {
                reader
                    .read_exact(&mut [0u8; 3])
                    .await
                    .map_err(|e| truncated(e, "ServerCutText padding"))?;
                let text = read_blob(reader, "ServerCutText body").await?;
                Ok(ServerMessage::ServerCutText(text))
            }
            other => Err(ProxyError::Protocol(format!(
                "unknown server message type: {other}"
            ))),
        }
    }

    /// Serializes the message, type byte first, into a byte buffer.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.message_type());
        match self {
            ServerMessage::FramebufferUpdate(rectangles) => {
                buf.put_u8(0); // padding
                buf.put_u16(rectangles.len() as u16);
                for rectangle in rectangles {
                    rectangle.write_to(buf);
                }
            }
            ServerMessage::SetColourMapEntries(map) => {
                buf.put_u8(0); // padding
                buf.put_u16(map.first_colour);
                buf.put_u16(map.colours.len() as u16);
                for colour in &map.colours {
                    buf.put_u16(colour.red);
                    buf.put_u16(colour.green);
                    buf.put_u16(colour.blue);
                }
            }
            ServerMessage::Bell => {}
            ServerMessage::ServerCutText(text) => {
                buf.put_bytes(0, 3); // padding
                put_blob(buf, text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip_client(message: ClientMessage) {
        let mut buf = BytesMut::new();
        message.write_to(&mut buf);
        let mut reader = &buf[..];
        let message_type = reader.read_u8().await.unwrap();
        assert_eq!(message_type, message.message_type());
        let parsed = ClientMessage::read_from(&mut reader, message_type)
            .await
            .unwrap();
        assert!(reader.is_empty(), "extra bytes after {parsed:?}");
        assert_eq!(parsed, message);
    }

    async fn roundtrip_server(message: ServerMessage) {
        let mut buf = BytesMut::new();
        message.write_to(&mut buf);
        let mut reader = &buf[..];
        let message_type = reader.read_u8().await.unwrap();
        let parsed = ServerMessage::read_from(
            &mut reader,
            message_type,
            &PixelFormat::rgba32(),
            &[Encoding::Raw, Encoding::CopyRect],
        )
        .await
        .unwrap();
        assert!(reader.is_empty(), "extra bytes after {parsed:?}");
        assert_eq!(parsed, message);
    }

    #[tokio::test]
    async fn test_client_message_roundtrips() {
        roundtrip_client(ClientMessage::SetPixelFormat(PixelFormat::rgba32())).await;
        roundtrip_client(ClientMessage::SetEncodings(vec![7, -260, 0, 99])).await;
        roundtrip_client(ClientMessage::FramebufferUpdateRequest {
            incremental: false,
            x: 0,
            y: 0,
            width: 1024,
            height: 768,
        })
        .await;
        roundtrip_client(ClientMessage::KeyEvent {
            down: true,
            key: 0x41,
        })
        .await;
        roundtrip_client(ClientMessage::PointerEvent {
            button_mask: 0b101,
            x: 512,
            y: 384,
        })
        .await;
        roundtrip_client(ClientMessage::ClientCutText(b"hello\xff".to_vec())).await;
        roundtrip_client(ClientMessage::QemuExtKeyEvent {
            submessage: 0,
            down: 1,
            keysym: 0x61,
            keycode: 0x1e,
        })
        .await;
    }

    #[tokio::test]
    async fn test_server_message_roundtrips() {
        roundtrip_server(ServerMessage::Bell).await;
        roundtrip_server(ServerMessage::ServerCutText(b"clip".to_vec())).await;
        roundtrip_server(ServerMessage::SetColourMapEntries(ColourMap {
            first_colour: 4,
            colours: vec![
                Colour {
                    red: 1,
                    green: 2,
                    blue: 3,
                },
                Colour {
                    red: 65535,
                    green: 0,
                    blue: 128,
                },
            ],
        }))
        .await;
        roundtrip_server(ServerMessage::FramebufferUpdate(vec![
            Rectangle {
                x: 0,
                y: 0,
                width: 2,
                height: 1,
                encoding: ENCODING_RAW,
                payload: vec![0xaa; 8],
            },
            Rectangle {
                x: 2,
                y: 0,
                width: 4,
                height: 4,
                encoding: ENCODING_COPYRECT,
                payload: vec![0, 1, 0, 2],
            },
        ]))
        .await;
    }

    #[tokio::test]
    async fn test_read_spans_partial_chunks() {
        // A message delivered in two transport chunks still parses whole.
        let mut wire = BytesMut::new();
        ClientMessage::KeyEvent {
            down: true,
            key: 0x20,
        }
        .write_to(&mut wire);
        let (head, tail) = wire.split_at(3);
        let mut reader = tokio_test::io::Builder::new().read(head).read(tail).build();
        let message_type = reader.read_u8().await.unwrap();
        let parsed = ClientMessage::read_from(&mut reader, message_type)
            .await
            .unwrap();
        assert_eq!(
            parsed,
            ClientMessage::KeyEvent {
                down: true,
                key: 0x20
            }
        );
    }

    #[tokio::test]
    async fn test_set_encodings_preserves_order() {
        let list = vec![16, 7, -239, 0, 1, -260];
        let mut buf = BytesMut::new();
        ClientMessage::SetEncodings(list.clone()).write_to(&mut buf);
        let mut reader = &buf[1..];
        match ClientMessage::read_from(&mut reader, CLIENT_MSG_SET_ENCODINGS)
            .await
            .unwrap()
        {
            ClientMessage::SetEncodings(parsed) => assert_eq!(parsed, list),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_truncated_set_encodings() {
        // Announces two encodings but carries only one.
        let mut buf = BytesMut::new();
        buf.put_u8(0); // padding
        buf.put_u16(2);
        buf.put_i32(0);
        let mut reader = &buf[..];
        let err = ClientMessage::read_from(&mut reader, CLIENT_MSG_SET_ENCODINGS)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Truncated(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_oversized_cut_text_rejected() {
        let mut buf = BytesMut::new();
        buf.put_bytes(0, 3); // padding
        buf.put_u32(64 * 1024 * 1024);
        let mut reader = &buf[..];
        let err = ClientMessage::read_from(&mut reader, CLIENT_MSG_CLIENT_CUT_TEXT)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_unknown_message_types_rejected() {
        let mut reader: &[u8] = &[];
        let err = ClientMessage::read_from(&mut reader, 42).await.unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
        let err = ServerMessage::read_from(&mut reader, 42, &PixelFormat::rgba32(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_rectangle_without_capability_rejected() {
        let mut buf = BytesMut::new();
        ServerMessage::FramebufferUpdate(vec![Rectangle {
            x: 0,
            y: 0,
            width: 1,
            height: 1,
            encoding: ENCODING_TIGHT,
            payload: vec![],
        }])
        .write_to(&mut buf);
        let mut reader = &buf[1..];
        let err = ServerMessage::read_from(
            &mut reader,
            SERVER_MSG_FRAMEBUFFER_UPDATE,
            &PixelFormat::rgba32(),
            &[Encoding::Raw],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)), "got {err:?}");
    }

    #[test]
    fn test_pixel_format_blob_is_16_bytes() {
        let mut buf = BytesMut::new();
        PixelFormat::rgba32().write_to(&mut buf);
        assert_eq!(buf.len(), 16);
    }

    #[tokio::test]
    async fn test_server_init_roundtrip() {
        let init = ServerInit {
            framebuffer_width: 1024,
            framebuffer_height: 768,
            pixel_format: PixelFormat::rgba32(),
            name: "workDesk".to_string(),
        };
        let mut buf = BytesMut::new();
        init.write_to(&mut buf);
        let mut reader = &buf[..];
        let parsed = ServerInit::read_from(&mut reader).await.unwrap();
        assert_eq!(parsed, init);
    }

    #[tokio::test]
    async fn test_version_strings() {
        for version in [ProtoVersion::Rfb33, ProtoVersion::Rfb37, ProtoVersion::Rfb38] {
            let mut buf = BytesMut::new();
            version.write_to(&mut buf);
            assert_eq!(buf.len(), 12);
            let mut reader = &buf[..];
            assert_eq!(ProtoVersion::read_from(&mut reader).await.unwrap(), version);
        }
        let mut reader: &[u8] = b"RFB 004.000\n";
        assert!(ProtoVersion::read_from(&mut reader).await.is_err());
    }
}
