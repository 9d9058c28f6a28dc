//! Error types for the tile cache.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::key::TileKey;

/// Errors raised by the on-disk index and shard files.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error on the index or a shard file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The index file does not begin with the `INDEX32` magic.
    #[error("{0} is not a tile index (bad magic)")]
    BadMagic(PathBuf),

    /// The index refers to a shard file that is not on disk.
    #[error("shard file {0} is missing")]
    MissingShard(PathBuf),

    /// Fewer bytes were read than the index entry records.
    #[error("short read for tile {key}: expected {expected} bytes, got {actual}")]
    ShortRead {
        /// Tile being read.
        key: TileKey,
        /// Size recorded in the index.
        expected: usize,
        /// Bytes actually available.
        actual: usize,
    },

    /// The caller's buffer cannot hold the stored tile.
    #[error("buffer of {available} bytes is too small for tile {key} ({required} bytes)")]
    BufferTooSmall {
        /// Tile being read.
        key: TileKey,
        /// Size recorded in the index.
        required: usize,
        /// Size of the caller's buffer.
        available: usize,
    },

    /// The payload is too short for the configured shard framing.
    #[error("payload of {len} bytes is too small (need more than {min})")]
    PayloadTooSmall {
        /// Payload length.
        len: usize,
        /// Length the payload must exceed.
        min: usize,
    },

    /// The tile is not present in the index.
    #[error("tile {0} is not in the index")]
    NotFound(TileKey),

    /// An offset or size no longer fits in a 32-bit index record.
    #[error("value {0} does not fit in an index record")]
    RecordOverflow(u64),

    /// An index entry names a shard that is not open.
    #[error("index entry refers to unknown shard {0}")]
    UnknownShard(i32),

    /// The store has already been closed.
    #[error("tile store is closed")]
    Closed,
}

/// Errors raised while downloading a tile.
///
/// Every variant maps to one of the legacy negative status codes through
/// [`FetchError::code`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// Host name lookup failed.
    #[error("DNS lookup for {host} failed: {source}")]
    Dns {
        /// Host being resolved.
        host: String,
        /// Underlying resolver error.
        #[source]
        source: std::io::Error,
    },

    /// Host name resolved, but not to the expected address.
    #[error("DNS for {host} resolved to {actual:?}, expected {expected}")]
    DnsMismatch {
        /// Host being resolved.
        host: String,
        /// Address the backend must resolve to.
        expected: IpAddr,
        /// Addresses actually returned.
        actual: Vec<IpAddr>,
    },

    /// TCP connect failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Address being connected to.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// Writing the request failed.
    #[error("sending request failed: {0}")]
    Send(#[source] std::io::Error),

    /// Reading the response failed.
    #[error("receiving response failed: {0}")]
    Receive(#[source] std::io::Error),

    /// The peer closed the connection before sending complete headers.
    #[error("connection closed before response headers arrived")]
    ClosedBeforeHeaders,

    /// Response headers carry no usable `Content-Length`.
    #[error("response has no Content-Length header")]
    MissingContentLength,

    /// Response declares an empty body.
    #[error("response declares Content-Length: 0")]
    ZeroContentLength,

    /// The peer closed the connection before the declared body arrived.
    #[error("response body truncated: expected {expected} bytes, got {actual}")]
    TruncatedBody {
        /// Declared body length.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },

    /// Chunked transfer-encoding framing is malformed.
    #[error("bad chunked framing: {0}")]
    BadChunk(String),

    /// The response carries neither a JFIF nor a GIF signature.
    #[error("response is not an image")]
    NotAnImage,

    /// The alternate backend failed recently and is cooling down.
    #[error("alternate backend cooling down for another {remaining:?}")]
    CoolingDown {
        /// Time left before the backend may be contacted again.
        remaining: Duration,
    },

    /// Caller's buffer cannot hold the downloaded tile.
    #[error("buffer of {available} bytes is too small for a {required} byte download")]
    BufferTooSmall {
        /// Downloaded length.
        required: usize,
        /// Size of the caller's buffer.
        available: usize,
    },

    /// HTTP client error.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Tileset id has no theme.
    #[error("unknown tileset {0}")]
    UnknownTileset(u8),
}

impl FetchError {
    /// Legacy negative status code for this failure.
    pub fn code(&self) -> i64 {
        match self {
            FetchError::Dns { .. }
            | FetchError::DnsMismatch { .. }
            | FetchError::Connect { .. }
            | FetchError::Send(_)
            | FetchError::Receive(_)
            | FetchError::BufferTooSmall { .. }
            | FetchError::Http(_)
            | FetchError::UnknownTileset(_) => -1,
            FetchError::ClosedBeforeHeaders
            | FetchError::MissingContentLength
            | FetchError::ZeroContentLength => -2,
            FetchError::NotAnImage => -3,
            FetchError::CoolingDown { .. } => -4,
            FetchError::BadChunk(_) => -5,
            FetchError::TruncatedBody { .. } => -6,
        }
    }

    /// Short label used for the failure metric.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::Dns { .. } => "dns",
            FetchError::DnsMismatch { .. } => "dns_mismatch",
            FetchError::Connect { .. } => "connect",
            FetchError::Send(_) => "send",
            FetchError::Receive(_) => "receive",
            FetchError::ClosedBeforeHeaders => "closed",
            FetchError::MissingContentLength | FetchError::ZeroContentLength => "content_length",
            FetchError::TruncatedBody { .. } => "truncated",
            FetchError::BadChunk(_) => "chunk",
            FetchError::NotAnImage => "not_image",
            FetchError::CoolingDown { .. } => "cooldown",
            FetchError::BufferTooSmall { .. } => "buffer",
            FetchError::Http(_) => "http",
            FetchError::UnknownTileset(_) => "tileset",
        }
    }
}

/// Errors raised while turning a tile buffer into pixels.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// A required signature is absent from the buffer.
    #[error("{0} marker not found")]
    MissingMarker(&'static str),

    /// A required HTTP header is absent or unparsable.
    #[error("bad or missing {0} header")]
    BadHeader(&'static str),

    /// The payload length differs from the declared `Content-Length`.
    #[error("payload is {actual} bytes but Content-Length says {declared}")]
    LengthMismatch {
        /// Declared length.
        declared: usize,
        /// Bytes after the header terminator.
        actual: usize,
    },

    /// Decoded image is not a square of the tile edge.
    #[error("decoded tile is {width}x{height}, expected {edge}x{edge}")]
    Dimensions {
        /// Expected edge length in pixels.
        edge: u32,
        /// Decoded width.
        width: u32,
        /// Decoded height.
        height: u32,
    },

    /// Image codec failure.
    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    /// Scratch file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error for cache, manager and composer operations.
#[derive(Debug, Error)]
pub enum TileError {
    /// Index or shard failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Download failure.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Decode failure.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Every download attempt for a tile failed.
    #[error("gave up on tile {key} after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Tile being fetched.
        key: TileKey,
        /// Attempts made.
        attempts: u32,
        /// Failure of the final attempt.
        #[source]
        last: Box<TileError>,
    },

    /// A tile manager is already open in this process.
    #[error("a tile manager is already open in this process")]
    AlreadyOpen,

    /// The raster has not been filled.
    #[error("raster has not been filled")]
    NotFilled,

    /// Query lies outside the filled raster.
    #[error("query ({easting}, {northing}) lies outside the raster")]
    OutOfBounds {
        /// Easting (or column) of the query, in meters.
        easting: i64,
        /// Northing (or row) of the query, in meters.
        northing: i64,
    },

    /// Query zone differs from the raster's zone.
    #[error("query zone {actual} does not match raster zone {expected}")]
    ZoneMismatch {
        /// Zone of the filled raster.
        expected: i8,
        /// Zone of the query.
        actual: i8,
    },

    /// Tileset id has no theme.
    #[error("unknown tileset {0}")]
    UnknownTileset(u8),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}
