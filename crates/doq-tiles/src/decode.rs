//! Tile buffer decoding.
//!
//! Buffers arrive with HTTP (or store framing) bytes still in front of the
//! image. Each decoder locates the image inside the buffer, hands it to the
//! codec through a scoped temporary file, and insists the result is exactly
//! one tile edge square.

use std::io::Write;

use image::{ImageFormat, ImageReader, RgbImage};
use tempfile::NamedTempFile;

use crate::error::DecodeError;
use crate::http::{find, header_end};

/// Decoded tile pixels.
pub type PixelGrid = RgbImage;

/// Bytes between the start of a JPEG stream and its `JFIF` identifier
/// (SOI marker, APP0 marker, APP0 length).
const JFIF_OFFSET: usize = 6;

const GIF_CONTENT_TYPE: &[u8] = b"Content-Type: image/gif\r\n";
const CONTENT_LENGTH: &[u8] = b"Content-Length: ";

/// Decode a JPEG tile embedded anywhere in `buf`.
pub fn decode_jpeg(buf: &[u8], edge: u32) -> Result<PixelGrid, DecodeError> {
    let start = find(buf, b"JFIF")
        .and_then(|p| p.checked_sub(JFIF_OFFSET))
        .ok_or(DecodeError::MissingMarker("JFIF"))?;
    decode_file(&buf[start..], ImageFormat::Jpeg, ".jpg", edge)
}

/// Decode a GIF tile from a buffer that still carries its HTTP headers.
///
/// The headers must declare `Content-Type: image/gif` and a
/// `Content-Length` equal to the number of bytes after the blank line.
pub fn decode_gif(buf: &[u8], edge: u32) -> Result<PixelGrid, DecodeError> {
    let type_at = find(buf, GIF_CONTENT_TYPE).ok_or(DecodeError::BadHeader("Content-Type"))?;
    let len_at = find(buf, CONTENT_LENGTH).ok_or(DecodeError::BadHeader("Content-Length"))?;

    let digits_at = len_at + CONTENT_LENGTH.len();
    let digits_len = buf[digits_at..]
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits_len == 0 || !buf[digits_at + digits_len..].starts_with(b"\r\n") {
        return Err(DecodeError::BadHeader("Content-Length"));
    }
    let declared: usize = std::str::from_utf8(&buf[digits_at..digits_at + digits_len])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(DecodeError::BadHeader("Content-Length"))?;

    // The blank line must come after both headers.
    let search_from = type_at.max(len_at);
    let body_at = header_end(&buf[search_from..])
        .map(|p| search_from + p)
        .ok_or(DecodeError::MissingMarker("header terminator"))?;

    let payload = &buf[body_at..];
    if payload.len() != declared {
        return Err(DecodeError::LengthMismatch {
            declared,
            actual: payload.len(),
        });
    }
    decode_file(payload, ImageFormat::Gif, ".gif", edge)
}

/// Try JPEG, then GIF.
pub fn decode_tile(buf: &[u8], edge: u32) -> Result<PixelGrid, DecodeError> {
    match decode_jpeg(buf, edge) {
        Ok(grid) => Ok(grid),
        Err(jpeg_err) => match decode_gif(buf, edge) {
            Ok(grid) => Ok(grid),
            Err(gif_err) => match jpeg_err {
                DecodeError::MissingMarker(_) => Err(gif_err),
                other => Err(other),
            },
        },
    }
}

fn decode_file(
    bytes: &[u8],
    format: ImageFormat,
    suffix: &str,
    edge: u32,
) -> Result<PixelGrid, DecodeError> {
    let mut scratch = tempfile::Builder::new()
        .prefix("doq-tile-")
        .suffix(suffix)
        .tempfile()?;
    scratch.write_all(bytes)?;
    scratch.flush()?;
    let grid = read_image(&scratch, format)?;
    drop(scratch);

    if grid.width() != edge || grid.height() != edge {
        return Err(DecodeError::Dimensions {
            edge,
            width: grid.width(),
            height: grid.height(),
        });
    }
    Ok(grid)
}

fn read_image(file: &NamedTempFile, format: ImageFormat) -> Result<PixelGrid, DecodeError> {
    let mut reader = ImageReader::open(file.path())?;
    reader.set_format(format);
    Ok(reader.decode()?.to_rgb8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    fn encode(edge: u32, format: ImageFormat) -> Vec<u8> {
        let img: RgbImage = ImageBuffer::from_fn(edge, edge, |x, y| Rgb([x as u8, y as u8, 128]));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    fn gif_response(body: &[u8], declared: usize) -> Vec<u8> {
        let mut raw = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: image/gif\r\nContent-Length: {}\r\n\r\n",
            declared
        )
        .into_bytes();
        raw.extend_from_slice(body);
        raw
    }

    #[test]
    fn test_jpeg_behind_http_headers() {
        let mut buf = b"HTTP/1.1 200 OK\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        buf.extend_from_slice(&encode(200, ImageFormat::Jpeg));
        let grid = decode_jpeg(&buf, 200).unwrap();
        assert_eq!(grid.dimensions(), (200, 200));
    }

    #[test]
    fn test_jpeg_wrong_size_rejected() {
        let buf = encode(100, ImageFormat::Jpeg);
        assert!(matches!(
            decode_jpeg(&buf, 200),
            Err(DecodeError::Dimensions { width: 100, height: 100, .. })
        ));
    }

    #[test]
    fn test_jpeg_marker_too_early() {
        assert!(matches!(
            decode_jpeg(b"JFIF....", 200),
            Err(DecodeError::MissingMarker("JFIF"))
        ));
        assert!(matches!(
            decode_jpeg(b"no marker", 200),
            Err(DecodeError::MissingMarker("JFIF"))
        ));
    }

    #[test]
    fn test_gif_with_exact_length() {
        let body = encode(200, ImageFormat::Gif);
        let grid = decode_gif(&gif_response(&body, body.len()), 200).unwrap();
        assert_eq!(grid.dimensions(), (200, 200));
    }

    #[test]
    fn test_gif_length_mismatch() {
        let body = encode(200, ImageFormat::Gif);
        assert!(matches!(
            decode_gif(&gif_response(&body, body.len() + 1), 200),
            Err(DecodeError::LengthMismatch { .. })
        ));
        let mut trailing = gif_response(&body, body.len());
        trailing.push(0);
        assert!(matches!(
            decode_gif(&trailing, 200),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_gif_requires_headers() {
        let body = encode(200, ImageFormat::Gif);
        assert!(matches!(
            decode_gif(&body, 200),
            Err(DecodeError::BadHeader("Content-Type"))
        ));
    }

    #[test]
    fn test_decode_tile_falls_back_to_gif() {
        let body = encode(200, ImageFormat::Gif);
        assert!(decode_tile(&gif_response(&body, body.len()), 200).is_ok());
        assert!(decode_tile(b"garbage", 200).is_err());
    }
}
