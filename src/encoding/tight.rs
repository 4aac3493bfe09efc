//! Tight and `TightPng` payload framing.
//!
//! A Tight rectangle starts with a compression-control byte. The high nibble
//! selects fill, JPEG, PNG, or basic compression; basic mode may carry an
//! explicit filter byte and a palette before the data. Data shorter than 12
//! bytes is sent raw, anything longer is prefixed with a 1-3 byte compact
//! length. All of it is consumed verbatim, never inflated.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::read_chunk;
use crate::error::{ProxyError, Result};
use crate::protocol::{truncated, PixelFormat, MAX_BLOB_LEN};

/// Compression control high nibble: solid fill.
const TIGHT_FILL: u8 = 0x08;

/// Compression control high nibble: JPEG data.
const TIGHT_JPEG: u8 = 0x09;

/// Compression control high nibble: PNG data (`TightPng` only).
const TIGHT_PNG: u8 = 0x0a;

/// Compression control bit: an explicit filter byte follows (basic mode).
const TIGHT_EXPLICIT_FILTER: u8 = 0x40;

/// Basic-mode filter: pixels as-is.
const TIGHT_FILTER_COPY: u8 = 0;

/// Basic-mode filter: indexed palette.
const TIGHT_FILTER_PALETTE: u8 = 1;

/// Basic-mode filter: gradient prediction.
const TIGHT_FILTER_GRADIENT: u8 = 2;

/// Basic-mode data below this size is sent raw, without zlib or a compact
/// length prefix.
const TIGHT_MIN_TO_COMPRESS: usize = 12;

/// Consumes the Tight payload for a `width` x `height` rectangle, appending
/// the bytes verbatim to `out`. `png` selects the `TightPng` variant, which
/// additionally allows PNG data.
pub(super) async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    width: u16,
    height: u16,
    format: &PixelFormat,
    png: bool,
    out: &mut Vec<u8>,
) -> Result<()> {
    let control = reader
        .read_u8()
        .await
        .map_err(|e| truncated(e, "Tight compression control"))?;
    out.push(control);

    let compression = control >> 4;
    if compression == TIGHT_FILL {
        read_chunk(reader, tight_pixel_size(format), "Tight fill colour", out).await
    } else if compression == TIGHT_JPEG || (compression == TIGHT_PNG && png) {
        let len = read_compact_length(reader, out).await?;
        read_chunk(reader, len, "Tight image data", out).await
    } else if compression & 0x08 == 0 {
        read_basic(reader, width, height, format, control, out).await
    } else {
        Err(ProxyError::Protocol(format!(
            "invalid Tight compression control {control:#04x}"
        )))
    }
}

/// Basic compression: optional filter byte and palette, then raw or
/// compact-length-prefixed data.
async fn read_basic<R: AsyncRead + Unpin>(
    reader: &mut R,
    width: u16,
    height: u16,
    format: &PixelFormat,
    control: u8,
    out: &mut Vec<u8>,
) -> Result<()> {
    let pixel_size = tight_pixel_size(format);
    let mut row_len = usize::from(width) * pixel_size;

    if control & TIGHT_EXPLICIT_FILTER != 0 {
        let filter = reader
            .read_u8()
            .await
            .map_err(|e| truncated(e, "Tight filter id"))?;
        out.push(filter);
        match filter {
            TIGHT_FILTER_COPY | TIGHT_FILTER_GRADIENT => {}
            TIGHT_FILTER_PALETTE => {
                let last_index = reader
                    .read_u8()
                    .await
                    .map_err(|e| truncated(e, "Tight palette size"))?;
                out.push(last_index);
                let colours = usize::from(last_index) + 1;
                read_chunk(reader, colours * pixel_size, "Tight palette", out).await?;
                row_len = if colours <= 2 {
                    (usize::from(width) + 7) / 8
                } else {
                    usize::from(width)
                };
            }
            other => {
                return Err(ProxyError::Protocol(format!(
                    "unknown Tight filter id {other}"
                )))
            }
        }
    }

    let data_len = row_len * usize::from(height);
    if data_len < TIGHT_MIN_TO_COMPRESS {
        read_chunk(reader, data_len, "Tight raw data", out).await
    } else {
        let len = read_compact_length(reader, out).await?;
        read_chunk(reader, len, "Tight compressed data", out).await
    }
}

/// A Tight pixel is 3 bytes for the dense 32bpp/depth-24 true-colour case,
/// otherwise the format's full pixel size.
fn tight_pixel_size(format: &PixelFormat) -> usize {
    if format.bits_per_pixel == 32 && format.depth == 24 && format.true_colour_flag != 0 {
        3
    } else {
        format.bytes_per_pixel()
    }
}

/// Reads the 1-3 byte compact length used by Tight for compressed data,
/// appending the raw length bytes to `out`.
async fn read_compact_length<R: AsyncRead + Unpin>(
    reader: &mut R,
    out: &mut Vec<u8>,
) -> Result<usize> {
    let b0 = reader
        .read_u8()
        .await
        .map_err(|e| truncated(e, "Tight compact length"))?;
    out.push(b0);
    let mut len = usize::from(b0 & 0x7f);
    if b0 & 0x80 != 0 {
        let b1 = reader
            .read_u8()
            .await
            .map_err(|e| truncated(e, "Tight compact length"))?;
        out.push(b1);
        len |= usize::from(b1 & 0x7f) << 7;
        if b1 & 0x80 != 0 {
            let b2 = reader
                .read_u8()
                .await
                .map_err(|e| truncated(e, "Tight compact length"))?;
            out.push(b2);
            len |= usize::from(b2) << 14;
        }
    }
    if len > MAX_BLOB_LEN {
        return Err(ProxyError::Protocol(format!(
            "Tight data length {len} exceeds limit"
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Encoding;
    use bytes::{BufMut, BytesMut};

    #[tokio::test]
    async fn test_tight_fill() {
        // 32bpp depth-24 true colour uses the 3-byte dense pixel.
        let wire = [0x80u8, 0x10, 0x20, 0x30];
        let mut reader = &wire[..];
        let payload = Encoding::Tight
            .read_payload(&mut reader, 100, 100, &PixelFormat::rgba32())
            .await
            .unwrap();
        assert_eq!(payload, wire);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_tight_jpeg_compact_length() {
        let data_len = 300usize;
        let mut wire = BytesMut::new();
        wire.put_u8(0x90);
        // 300 = 0b10_0101100: low 7 bits with continuation, then high bits.
        wire.put_u8(0x80 | (300 & 0x7f) as u8);
        wire.put_u8((300 >> 7) as u8);
        wire.put_bytes(0xee, data_len);
        let mut reader = &wire[..];
        let payload = Encoding::Tight
            .read_payload(&mut reader, 64, 48, &PixelFormat::rgba32())
            .await
            .unwrap();
        assert_eq!(payload, &wire[..]);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_tight_basic_palette() {
        // 16x4 rectangle, two-colour palette: one bit per pixel, 2 bytes per
        // row, 8 bytes total, below the compression threshold.
        let mut wire = BytesMut::new();
        wire.put_u8(TIGHT_EXPLICIT_FILTER);
        wire.put_u8(TIGHT_FILTER_PALETTE);
        wire.put_u8(1); // palette of two colours
        wire.put_bytes(0x07, 2 * 3);
        wire.put_bytes(0xf0, 2 * 4);
        let mut reader = &wire[..];
        let payload = Encoding::Tight
            .read_payload(&mut reader, 16, 4, &PixelFormat::rgba32())
            .await
            .unwrap();
        assert_eq!(payload, &wire[..]);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_tight_png_only_for_tightpng() {
        let wire = [0xa0u8, 0x01, 0xff];
        let mut reader = &wire[..];
        let err = Encoding::Tight
            .read_payload(&mut reader, 8, 8, &PixelFormat::rgba32())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)), "got {err:?}");

        let mut reader = &wire[..];
        let payload = Encoding::TightPng
            .read_payload(&mut reader, 8, 8, &PixelFormat::rgba32())
            .await
            .unwrap();
        assert_eq!(payload, wire);
    }
}
