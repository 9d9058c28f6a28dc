//! HTTP/1.1 request text and response framing for tile downloads.
//!
//! Tile responses are kept as raw bytes, headers included, because the GIF
//! decoder and the legacy store layout both depend on the header text. A
//! chunked response is instead reassembled behind a zeroed
//! [`CHUNKED_PREFIX_LEN`]-byte prefix.

use std::io::Read;

use crate::error::FetchError;
use crate::geo::{utm_to_lat_long, UtmPoint};
use crate::key::TileKey;
use crate::theme::Theme;

/// Zeroed bytes reserved ahead of a de-chunked body.
pub const CHUNKED_PREFIX_LEN: usize = 80;

/// Datum shift applied to the alternate backend's bounding box.
const ALTERNATE_DATUM_SHIFT: (f64, f64) = (23.0, 158.0);

const RECV_CHUNK: usize = 8192;

/// One tile GET request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRequest {
    /// Value of the `Host` header.
    pub host: String,
    /// Origin-form request target, starting with `/`.
    pub path_and_query: String,
    /// Send `Connection: Keep-Alive` rather than `Connection: Close`.
    pub keep_alive: bool,
}

impl TileRequest {
    /// Request a tile from the coordinate-addressed primary server.
    pub fn primary(host: &str, theme: &Theme, key: &TileKey, keep_alive: bool) -> Self {
        Self {
            host: host.to_string(),
            path_and_query: format!(
                "/tile.ashx?S={}&T={}&X={}&Y={}&Z={}",
                theme.scale, theme.theme_code, key.x, key.y, key.zone
            ),
            keep_alive,
        }
    }

    /// Request a tile from the WMS server.
    ///
    /// The bounding box is the tile footprint, shifted by the datum offset
    /// and widened by the margin on every side, in `lon,lat,lon,lat` order.
    pub fn alternate(host: &str, theme: &Theme, key: &TileKey) -> Self {
        let (lon1, lat1, lon2, lat2) = wms_bbox(theme, key);
        Self {
            host: host.to_string(),
            path_and_query: format!(
                "/wms.cgi?request=GetMap&layers=global_mosaic&srs=EPSG:4326\
                 &width={edge}&height={edge}&bbox={lon1:.6},{lat1:.6},{lon2:.6},{lat2:.6}\
                 &format=image/jpeg&styles=visual&zoom=",
                edge = theme.edge_px,
            ),
            keep_alive: false,
        }
    }

    /// `Connection` header value.
    pub fn connection(&self) -> &'static str {
        if self.keep_alive {
            "Keep-Alive"
        } else {
            "Close"
        }
    }

    /// Literal request text. Through a proxy the request target is in
    /// absolute form.
    pub fn to_wire(&self, via_proxy: bool) -> String {
        let target = if via_proxy {
            format!("http://{}{}", self.host, self.path_and_query)
        } else {
            self.path_and_query.clone()
        };
        format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: {}\r\n\r\n",
            target,
            self.host,
            self.connection()
        )
    }
}

/// `(lon1, lat1, lon2, lat2)` for a WMS tile request.
pub fn wms_bbox(theme: &Theme, key: &TileKey) -> (f64, f64, f64, f64) {
    let size = f64::from(theme.tile_meters);
    let margin = f64::from(theme.margin_px) * theme.meters_per_pixel;
    let sw = UtmPoint::new(
        f64::from(key.x) * size + ALTERNATE_DATUM_SHIFT.0 - margin,
        f64::from(key.y) * size + ALTERNATE_DATUM_SHIFT.1 - margin,
        key.zone,
    );
    let ne = sw.offset(size + 2.0 * margin, size + 2.0 * margin);
    let (lat1, lon1) = utm_to_lat_long(&sw);
    let (lat2, lon2) = utm_to_lat_long(&ne);
    (lon1, lat1, lon2, lat2)
}

/// Position of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Offset of the first body byte, just past `\r\n\r\n`.
pub fn header_end(buf: &[u8]) -> Option<usize> {
    find(buf, b"\r\n\r\n").map(|p| p + 4)
}

/// Value of a header, matched case-insensitively by name.
pub fn header_value<'a>(headers: &'a [u8], name: &str) -> Option<&'a str> {
    let text = std::str::from_utf8(headers).ok()?;
    text.split("\r\n").skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        n.trim().eq_ignore_ascii_case(name).then(|| v.trim())
    })
}

/// Parsed `Content-Length`, if present and numeric.
pub fn content_length(headers: &[u8]) -> Option<usize> {
    header_value(headers, "Content-Length")?.parse().ok()
}

/// Whether the headers announce chunked transfer-encoding.
pub fn is_chunked(headers: &[u8]) -> bool {
    header_value(headers, "Transfer-Encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
}

/// Fail unless the buffer carries a JFIF or GIF signature.
pub fn check_image(buf: &[u8]) -> Result<(), FetchError> {
    if find(buf, b"JFIF").is_some() || find(buf, b"GIF8").is_some() {
        Ok(())
    } else {
        Err(FetchError::NotAnImage)
    }
}

/// Read one response from `reader`.
///
/// Non-chunked responses are returned raw, headers included, once
/// `Content-Length` body bytes have arrived. Chunked responses are read to
/// the terminating chunk (or connection close) and returned de-chunked
/// behind the reserved prefix.
pub fn read_response<R: Read>(reader: &mut R) -> Result<Vec<u8>, FetchError> {
    let mut buf = Vec::with_capacity(RECV_CHUNK);
    let mut chunk = [0u8; RECV_CHUNK];

    let body_start = loop {
        if let Some(end) = header_end(&buf) {
            break end;
        }
        let n = reader.read(&mut chunk).map_err(FetchError::Receive)?;
        if n == 0 {
            return Err(FetchError::ClosedBeforeHeaders);
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if is_chunked(&buf[..body_start]) {
        let mut needed = 0;
        loop {
            let body = &buf[body_start..];
            if body.len() >= needed {
                match parse_chunked(body)? {
                    Chunked::Complete(out) => return Ok(out),
                    Chunked::Incomplete { needed: n } => needed = n,
                }
            }
            let n = reader.read(&mut chunk).map_err(FetchError::Receive)?;
            if n == 0 {
                return dechunk(&buf[body_start..]);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    let expected = match content_length(&buf[..body_start]) {
        None => return Err(FetchError::MissingContentLength),
        Some(0) => return Err(FetchError::ZeroContentLength),
        Some(n) => n,
    };
    while buf.len() - body_start < expected {
        let n = reader.read(&mut chunk).map_err(FetchError::Receive)?;
        if n == 0 {
            return Err(FetchError::TruncatedBody {
                expected,
                actual: buf.len() - body_start,
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    buf.truncate(body_start + expected);
    Ok(buf)
}

/// Reassemble a chunked body behind [`CHUNKED_PREFIX_LEN`] zero bytes.
pub fn dechunk(body: &[u8]) -> Result<Vec<u8>, FetchError> {
    match parse_chunked(body)? {
        Chunked::Complete(out) => Ok(out),
        Chunked::Incomplete { needed } => Err(FetchError::TruncatedBody {
            expected: needed,
            actual: body.len(),
        }),
    }
}

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 1024;

/// Largest single chunk accepted.
const MAX_CHUNK_LEN: usize = 16 << 20;

/// Outcome of parsing a possibly partial chunked body.
#[derive(Debug)]
enum Chunked {
    /// The terminating chunk and trailer section have arrived.
    Complete(Vec<u8>),
    /// The body is valid so far but ends early; `needed` is the body length
    /// worth parsing again at.
    Incomplete { needed: usize },
}

fn parse_chunked(body: &[u8]) -> Result<Chunked, FetchError> {
    let mut out = vec![0u8; CHUNKED_PREFIX_LEN];
    let mut pos = 0;
    loop {
        let Some(line_end) = line_end(body, pos)? else {
            return Ok(Chunked::Incomplete { needed: body.len() + 1 });
        };
        let line = std::str::from_utf8(&body[pos..line_end])
            .map_err(|_| FetchError::BadChunk("chunk size is not ASCII".into()))?;
        let digits = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(digits, 16)
            .map_err(|_| FetchError::BadChunk(format!("bad chunk size {:?}", digits)))?;
        if size > MAX_CHUNK_LEN {
            return Err(FetchError::BadChunk(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                size, MAX_CHUNK_LEN
            )));
        }
        pos = line_end + 2;
        if size == 0 {
            return skip_trailers(body, pos, out);
        }

        let data_end = pos + size;
        let frame_end = data_end + 2;
        if body.len() < frame_end {
            return Ok(Chunked::Incomplete { needed: frame_end });
        }
        if &body[data_end..frame_end] != b"\r\n" {
            return Err(FetchError::BadChunk("chunk data not followed by CRLF".into()));
        }
        out.extend_from_slice(&body[pos..data_end]);
        pos = frame_end;
    }
}

/// Consume trailer lines up to the blank line that ends the body.
fn skip_trailers(body: &[u8], mut pos: usize, out: Vec<u8>) -> Result<Chunked, FetchError> {
    loop {
        let Some(end) = line_end(body, pos)? else {
            return Ok(Chunked::Incomplete { needed: body.len() + 1 });
        };
        if end == pos {
            return Ok(Chunked::Complete(out));
        }
        pos = end + 2;
    }
}

/// End of the CRLF-terminated line starting at `pos`, once it has arrived.
fn line_end(body: &[u8], pos: usize) -> Result<Option<usize>, FetchError> {
    let rest = &body[pos..];
    match find(rest, b"\r\n") {
        Some(p) if p <= MAX_CHUNK_LINE => Ok(Some(pos + p)),
        None if rest.len() <= MAX_CHUNK_LINE => Ok(None),
        _ => Err(FetchError::BadChunk("chunk line too long".into())),
    }
}
