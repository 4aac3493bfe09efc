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

//! VNC framebuffer encoding capabilities.
//!
//! The proxy forwards framebuffer rectangles without decoding pixels, but it
//! still has to know where each rectangle's payload ends: encodings are
//! self-framing and their framing rules differ. Each [`Encoding`] capability
//! knows its wire type id and how to consume exactly one rectangle payload
//! of that type, returning the bytes verbatim for forwarding and recording.
//!
//! Fixed-size payloads (Raw, CopyRect, RRE, CoRRE, Cursor) are computed from
//! the rectangle header and pixel format. Zlib and ZRLE are u32-length
//! prefixed. Hextile and Tight carry real sub-framing, handled in their own
//! modules.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};
use crate::protocol::{self, truncated, PixelFormat};

pub mod hextile;
pub mod tight;

/// Upper bound for a single rectangle payload computed from its header.
///
/// Pixel-derived sizes can legitimately exceed the generic blob limit on
/// large desktops, so they get their own sanity cap.
const MAX_RECT_PAYLOAD: usize = 256 * 1024 * 1024;

/// A framebuffer encoding or pseudo-encoding the proxy can frame payloads for.
///
/// The set matches what the proxy registers on its upstream leg; the inbound
/// leg is configured with a subset. Order within a leg's active list is the
/// peer's preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Raw pixel data.
    Raw,
    /// Copy rectangle (source position only).
    CopyRect,
    /// Rise-and-Run-length Encoding.
    Rre,
    /// Compact RRE.
    CoRre,
    /// Hextile 16x16 tiles.
    Hextile,
    /// Zlib-compressed raw data.
    Zlib,
    /// Tight encoding.
    Tight,
    /// Zlib Run-Length Encoding.
    Zrle,
    /// Tight with PNG payloads.
    TightPng,
    /// Rich cursor pseudo-encoding.
    CursorPseudo,
    /// Keyboard LED state pseudo-encoding.
    LedStatePseudo,
}

impl Encoding {
    /// The signed 32-bit wire identifier of this encoding.
    #[must_use]
    pub fn encoding_type(&self) -> i32 {
        match self {
            Encoding::Raw => protocol::ENCODING_RAW,
            Encoding::CopyRect => protocol::ENCODING_COPYRECT,
            Encoding::Rre => protocol::ENCODING_RRE,
            Encoding::CoRre => protocol::ENCODING_CORRE,
            Encoding::Hextile => protocol::ENCODING_HEXTILE,
            Encoding::Zlib => protocol::ENCODING_ZLIB,
            Encoding::Tight => protocol::ENCODING_TIGHT,
            Encoding::Zrle => protocol::ENCODING_ZRLE,
            Encoding::TightPng => protocol::ENCODING_TIGHTPNG,
            Encoding::CursorPseudo => protocol::ENCODING_CURSOR,
            Encoding::LedStatePseudo => protocol::ENCODING_LED_STATE,
        }
    }

    /// Looks up the capability for a wire encoding type.
    ///
    /// Returns `None` for encoding types the proxy cannot frame.
    #[must_use]
    pub fn for_type(encoding_type: i32) -> Option<Encoding> {
        match encoding_type {
            protocol::ENCODING_RAW => Some(Encoding::Raw),
            protocol::ENCODING_COPYRECT => Some(Encoding::CopyRect),
            protocol::ENCODING_RRE => Some(Encoding::Rre),
            protocol::ENCODING_CORRE => Some(Encoding::CoRre),
            protocol::ENCODING_HEXTILE => Some(Encoding::Hextile),
            protocol::ENCODING_ZLIB => Some(Encoding::Zlib),
            protocol::ENCODING_TIGHT => Some(Encoding::Tight),
            protocol::ENCODING_ZRLE => Some(Encoding::Zrle),
            protocol::ENCODING_TIGHTPNG => Some(Encoding::TightPng),
            protocol::ENCODING_CURSOR => Some(Encoding::CursorPseudo),
            protocol::ENCODING_LED_STATE => Some(Encoding::LedStatePseudo),
            _ => None,
        }
    }

    /// The full capability set registered on the upstream leg.
    #[must_use]
    pub fn proxy_defaults() -> Vec<Encoding> {
        vec![
            Encoding::Raw,
            Encoding::Tight,
            Encoding::CursorPseudo,
            Encoding::LedStatePseudo,
            Encoding::TightPng,
            Encoding::Rre,
            Encoding::Zlib,
            Encoding::Zrle,
            Encoding::CopyRect,
            Encoding::CoRre,
            Encoding::Hextile,
        ]
    }

    /// Consumes one rectangle payload of this encoding from the stream and
    /// returns it verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Protocol`] for payloads whose declared size is
    /// out of range, [`ProxyError::Truncated`] when the stream ends inside
    /// the payload, and [`ProxyError::Io`] on transport failure.
    pub async fn read_payload<R: AsyncRead + Unpin>(
        &self,
        reader: &mut R,
        width: u16,
        height: u16,
        format: &PixelFormat,
    ) -> Result<Vec<u8>> {
        let bypp = format.bytes_per_pixel();
        let area = usize::from(width) * usize::from(height);
        let mut payload = Vec::new();
        match self {
            Encoding::Raw => {
                read_chunk(reader, area * bypp, "Raw pixels", &mut payload).await?;
            }
            Encoding::CopyRect => {
                read_chunk(reader, 4, "CopyRect source position", &mut payload).await?;
            }
            Encoding::Rre => {
                let count = reader
                    .read_u32()
                    .await
                    .map_err(|e| truncated(e, "RRE subrectangle count"))?;
                payload.extend_from_slice(&count.to_be_bytes());
                let body = bypp + count as usize * (bypp + 8);
                read_chunk(reader, body, "RRE subrectangles", &mut payload).await?;
            }
            Encoding::CoRre => {
                let count = reader
                    .read_u32()
                    .await
                    .map_err(|e| truncated(e, "CoRRE subrectangle count"))?;
                payload.extend_from_slice(&count.to_be_bytes());
                let body = bypp + count as usize * (bypp + 4);
                read_chunk(reader, body, "CoRRE subrectangles", &mut payload).await?;
            }
            Encoding::Hextile => {
                hextile::read_payload(reader, width, height, format, &mut payload).await?;
            }
            Encoding::Zlib => {
                read_prefixed_chunk(reader, "Zlib data", &mut payload).await?;
            }
            Encoding::Zrle => {
                read_prefixed_chunk(reader, "ZRLE data", &mut payload).await?;
            }
            Encoding::Tight => {
                tight::read_payload(reader, width, height, format, false, &mut payload).await?;
            }
            Encoding::TightPng => {
                tight::read_payload(reader, width, height, format, true, &mut payload).await?;
            }
            Encoding::CursorPseudo => {
                let mask = (usize::from(width) + 7) / 8 * usize::from(height);
                read_chunk(reader, area * bypp + mask, "cursor shape", &mut payload).await?;
            }
            Encoding::LedStatePseudo => {
                read_chunk(reader, 1, "LED state", &mut payload).await?;
            }
        }
        Ok(payload)
    }
}

/// Appends exactly `len` bytes from the stream to `out`.
pub(crate) async fn read_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    len: usize,
    what: &'static str,
    out: &mut Vec<u8>,
) -> Result<()> {
    if len > MAX_RECT_PAYLOAD {
        return Err(ProxyError::Protocol(format!(
            "{what} length {len} exceeds limit"
        )));
    }
    let start = out.len();
    out.resize(start + len, 0);
    reader
        .read_exact(&mut out[start..])
        .await
        .map_err(|e| truncated(e, what))?;
    Ok(())
}

/// Appends a u32 length prefix and that many bytes from the stream to `out`.
async fn read_prefixed_chunk<R: AsyncRead + Unpin>(
    reader: &mut R,
    what: &'static str,
    out: &mut Vec<u8>,
) -> Result<()> {
    let len = reader.read_u32().await.map_err(|e| truncated(e, what))? as usize;
    if len > protocol::MAX_BLOB_LEN {
        return Err(ProxyError::Protocol(format!(
            "{what} length {len} exceeds limit"
        )));
    }
    out.extend_from_slice(&(len as u32).to_be_bytes());
    read_chunk(reader, len, what, out).await
}
