//! Hextile payload framing.
//!
//! Hextile splits a rectangle into 16x16 tiles, each introduced by a
//! subencoding byte. Tile payload sizes follow from that byte and the pixel
//! format, so the whole rectangle can be consumed without decoding.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::read_chunk;
use crate::error::Result;
use crate::protocol::{
    truncated, PixelFormat, HEXTILE_ANY_SUBRECTS, HEXTILE_BACKGROUND_SPECIFIED,
    HEXTILE_FOREGROUND_SPECIFIED, HEXTILE_RAW, HEXTILE_SUBRECTS_COLOURED,
};

/// Consumes the Hextile payload for a `width` x `height` rectangle, tile by
/// tile, appending the bytes verbatim to `out`.
pub(super) async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    width: u16,
    height: u16,
    format: &PixelFormat,
    out: &mut Vec<u8>,
) -> Result<()> {
    let bypp = format.bytes_per_pixel();
    for tile_y in (0..height).step_by(16) {
        let tile_height = usize::from((height - tile_y).min(16));
        for tile_x in (0..width).step_by(16) {
            let tile_width = usize::from((width - tile_x).min(16));
            let subencoding = reader
                .read_u8()
                .await
                .map_err(|e| truncated(e, "Hextile subencoding"))?;
            out.push(subencoding);

            if subencoding & HEXTILE_RAW != 0 {
                read_chunk(reader, tile_width * tile_height * bypp, "Hextile raw tile", out)
                    .await?;
                continue;
            }
            if subencoding & HEXTILE_BACKGROUND_SPECIFIED != 0 {
                read_chunk(reader, bypp, "Hextile background", out).await?;
            }
            if subencoding & HEXTILE_FOREGROUND_SPECIFIED != 0 {
                read_chunk(reader, bypp, "Hextile foreground", out).await?;
            }
            if subencoding & HEXTILE_ANY_SUBRECTS != 0 {
                let count = reader
                    .read_u8()
                    .await
                    .map_err(|e| truncated(e, "Hextile subrect count"))?;
                out.push(count);
                let per_subrect = if subencoding & HEXTILE_SUBRECTS_COLOURED != 0 {
                    bypp + 2
                } else {
                    2
                };
                read_chunk(
                    reader,
                    usize::from(count) * per_subrect,
                    "Hextile subrects",
                    out,
                )
                .await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Encoding;
    use bytes::{BufMut, BytesMut};

    #[tokio::test]
    async fn test_hextile_mixed_tiles() {
        // 20x20 rectangle: four tiles of 16x16, 4x16, 16x4, 4x4.
        let format = PixelFormat::rgba32();
        let mut wire = BytesMut::new();
        // Tile 1 (16x16): raw.
        wire.put_u8(HEXTILE_RAW);
        wire.put_bytes(0x01, 16 * 16 * 4);
        // Tile 2 (4x16): background only.
        wire.put_u8(HEXTILE_BACKGROUND_SPECIFIED);
        wire.put_bytes(0x02, 4);
        // Tile 3 (16x4): foreground plus two monochrome subrects.
        wire.put_u8(HEXTILE_FOREGROUND_SPECIFIED | HEXTILE_ANY_SUBRECTS);
        wire.put_bytes(0x03, 4);
        wire.put_u8(2);
        wire.put_bytes(0x04, 2 * 2);
        // Tile 4 (4x4): three coloured subrects.
        wire.put_u8(HEXTILE_ANY_SUBRECTS | HEXTILE_SUBRECTS_COLOURED);
        wire.put_u8(3);
        wire.put_bytes(0x05, 3 * (4 + 2));

        let mut reader = &wire[..];
        let payload = Encoding::Hextile
            .read_payload(&mut reader, 20, 20, &format)
            .await
            .unwrap();
        assert_eq!(payload, &wire[..]);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_hextile_empty_tile_stream() {
        // A tile with no flags carries just the subencoding byte.
        let wire = [0u8; 1];
        let mut reader = &wire[..];
        let payload = Encoding::Hextile
            .read_payload(&mut reader, 8, 8, &PixelFormat::rgba32())
            .await
            .unwrap();
        assert_eq!(payload, wire);
    }
}
