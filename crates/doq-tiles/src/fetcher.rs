//! Tile downloads.
//!
//! [`NetworkFetcher`] picks the backend from the tile's theme, resolves and
//! validates the backend address once, sends the request over a
//! [`Transport`] and checks that the answer is an image. Failures come back
//! as [`FetchError`]s; retrying is the caller's business.

use std::collections::HashMap;
use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use doq_metrics::metric_defs;
use reqwest::blocking::Client;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use tracing::{debug, info, warn};

use crate::config::{NetworkConfig, ProxyConfig, TransportKind};
use crate::error::FetchError;
use crate::http::{self, TileRequest, CHUNKED_PREFIX_LEN};
use crate::key::TileKey;
use crate::theme::{Backend, Theme};

/// Source of raw tile buffers.
pub trait TileFetch: Send {
    /// Download one tile. The buffer is the raw HTTP response, or a
    /// de-chunked body behind a zeroed prefix.
    fn fetch(&mut self, key: &TileKey) -> Result<Vec<u8>, FetchError>;
}

impl<F: TileFetch + ?Sized> TileFetch for Box<F> {
    fn fetch(&mut self, key: &TileKey) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(key)
    }
}

/// Where a request goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// Address to connect to (the proxy's, when proxied).
    pub addr: SocketAddr,
    /// Port of the origin server.
    pub port: u16,
    /// Whether `addr` is an HTTP proxy.
    pub via_proxy: bool,
}

/// Performs one request/response exchange.
pub trait Transport: Send {
    fn round_trip(&mut self, target: &Target, request: &TileRequest) -> Result<Vec<u8>, FetchError>;
}

// ============================================================================
// Socket transport
// ============================================================================

/// Sends the literal request text over a `TcpStream` and frames the
/// response itself. Keep-alive connections are reused.
#[derive(Debug, Default)]
pub struct SocketTransport {
    read_timeout: Option<Duration>,
    conn: Option<(SocketAddr, TcpStream)>,
}

impl SocketTransport {
    pub fn new(read_timeout: Option<Duration>) -> Self {
        Self {
            read_timeout,
            conn: None,
        }
    }

    fn connect(&self, addr: SocketAddr) -> Result<TcpStream, FetchError> {
        let connect_err = |source: io::Error| FetchError::Connect {
            addr: addr.to_string(),
            source,
        };
        let stream = TcpStream::connect(addr).map_err(connect_err)?;
        stream.set_read_timeout(self.read_timeout).map_err(connect_err)?;
        debug!(%addr, "connected");
        Ok(stream)
    }

    fn exchange(stream: &mut TcpStream, wire: &str) -> Result<Vec<u8>, FetchError> {
        stream.write_all(wire.as_bytes()).map_err(FetchError::Send)?;
        http::read_response(stream)
    }
}

impl Transport for SocketTransport {
    fn round_trip(&mut self, target: &Target, request: &TileRequest) -> Result<Vec<u8>, FetchError> {
        let wire = request.to_wire(target.via_proxy);

        let reused = match self.conn.take() {
            Some((addr, stream)) if addr == target.addr => Some(stream),
            _ => None,
        };
        let (stream, response) = match reused {
            Some(mut stream) => match Self::exchange(&mut stream, &wire) {
                Ok(response) => (stream, response),
                // The server may have dropped an idle keep-alive connection.
                Err(FetchError::Send(_)) | Err(FetchError::ClosedBeforeHeaders) => {
                    debug!(addr = %target.addr, "stale connection, reconnecting");
                    let mut fresh = self.connect(target.addr)?;
                    let response = Self::exchange(&mut fresh, &wire)?;
                    (fresh, response)
                }
                Err(e) => return Err(e),
            },
            None => {
                let mut fresh = self.connect(target.addr)?;
                let response = Self::exchange(&mut fresh, &wire)?;
                (fresh, response)
            }
        };

        if request.keep_alive {
            self.conn = Some((target.addr, stream));
        }
        Ok(response)
    }
}

// ============================================================================
// reqwest transport
// ============================================================================

/// Sends requests with the `reqwest` blocking client.
///
/// Validated backend addresses are pinned into the client so no second DNS
/// lookup happens. The response is rebuilt into the same raw shape the
/// socket transport produces.
#[derive(Debug)]
pub struct ClientTransport {
    proxy: Option<ProxyConfig>,
    keep_alive: bool,
    read_timeout: Option<Duration>,
    pins: HashMap<String, SocketAddr>,
    client: Option<Client>,
}

impl ClientTransport {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            proxy: config.proxy.clone(),
            keep_alive: config.keep_alive,
            read_timeout: config.read_timeout(),
            pins: HashMap::new(),
            client: None,
        }
    }

    fn build(&self) -> Result<Client, FetchError> {
        let mut builder = Client::builder()
            .timeout(self.read_timeout)
            .pool_max_idle_per_host(if self.keep_alive { usize::MAX } else { 0 });
        builder = match &self.proxy {
            Some(p) => builder.proxy(reqwest::Proxy::http(format!("http://{}:{}", p.host, p.port))?),
            None => builder.no_proxy(),
        };
        for (host, addr) in &self.pins {
            builder = builder.resolve(host, *addr);
        }
        Ok(builder.build()?)
    }
}

impl Transport for ClientTransport {
    fn round_trip(&mut self, target: &Target, request: &TileRequest) -> Result<Vec<u8>, FetchError> {
        let stale = !target.via_proxy && self.pins.get(&request.host) != Some(&target.addr);
        if stale {
            self.pins.insert(request.host.clone(), target.addr);
        }
        let client = match self.client.take() {
            Some(client) if !stale => client,
            _ => self.build()?,
        };
        let client = self.client.insert(client);

        let url = format!(
            "http://{}:{}{}",
            request.host, target.port, request.path_and_query
        );
        let response = client
            .get(&url)
            .header(CONNECTION, request.connection())
            .send()?;

        let status = response.status();
        let chunked = response
            .headers()
            .get(TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());

        let mut raw = format!(
            "{:?} {} {}\r\n",
            response.version(),
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        for (name, value) in response.headers() {
            raw.extend_from_slice(title_case(name.as_str()).as_bytes());
            raw.extend_from_slice(b": ");
            raw.extend_from_slice(value.as_bytes());
            raw.extend_from_slice(b"\r\n");
        }
        raw.extend_from_slice(b"\r\n");

        let body = response.bytes()?;
        if chunked {
            let mut out = vec![0u8; CHUNKED_PREFIX_LEN];
            out.extend_from_slice(&body);
            return Ok(out);
        }
        match declared {
            None => Err(FetchError::MissingContentLength),
            Some(0) => Err(FetchError::ZeroContentLength),
            Some(n) if body.len() < n => Err(FetchError::TruncatedBody {
                expected: n,
                actual: body.len(),
            }),
            Some(_) => {
                raw.extend_from_slice(&body);
                Ok(raw)
            }
        }
    }
}

/// `content-type` to `Content-Type`.
fn title_case(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

// ============================================================================
// Fetcher
// ============================================================================

/// Downloads tiles from the configured backends.
pub struct NetworkFetcher {
    config: NetworkConfig,
    cooldown: Duration,
    transport: Box<dyn Transport>,
    resolved: HashMap<(String, u16), SocketAddr>,
    alternate_failed_at: Option<Instant>,
}

impl std::fmt::Debug for NetworkFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkFetcher")
            .field("transport", &self.config.transport)
            .field("resolved", &self.resolved)
            .field("alternate_failed_at", &self.alternate_failed_at)
            .finish()
    }
}

impl NetworkFetcher {
    /// Fetcher using the transport named in `config`.
    pub fn new(config: &NetworkConfig, alternate_cooldown: Duration) -> Self {
        let transport: Box<dyn Transport> = match config.transport {
            TransportKind::Client => Box::new(ClientTransport::new(config)),
            TransportKind::Socket => Box::new(SocketTransport::new(config.read_timeout())),
        };
        Self::with_transport(config, alternate_cooldown, transport)
    }

    /// Fetcher using a caller-supplied transport.
    pub fn with_transport(
        config: &NetworkConfig,
        alternate_cooldown: Duration,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            config: config.clone(),
            cooldown: alternate_cooldown,
            transport,
            resolved: HashMap::new(),
            alternate_failed_at: None,
        }
    }

    /// Resolve `host:port` once, checking it against `expected` if given.
    fn resolve(
        &mut self,
        host: &str,
        port: u16,
        expected: Option<IpAddr>,
    ) -> Result<SocketAddr, FetchError> {
        if let Some(addr) = self.resolved.get(&(host.to_string(), port)) {
            return Ok(*addr);
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|source| FetchError::Dns {
                host: host.to_string(),
                source,
            })?
            .collect();

        let addr = match expected {
            Some(ip) => addrs.iter().find(|a| a.ip() == ip).copied().ok_or_else(|| {
                FetchError::DnsMismatch {
                    host: host.to_string(),
                    expected: ip,
                    actual: addrs.iter().map(|a| a.ip()).collect(),
                }
            })?,
            None => addrs.first().copied().ok_or_else(|| FetchError::Dns {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses"),
            })?,
        };

        info!(host, %addr, "resolved tile server");
        self.resolved.insert((host.to_string(), port), addr);
        Ok(addr)
    }

    fn try_fetch(&mut self, theme: &Theme, key: &TileKey) -> Result<Vec<u8>, FetchError> {
        if theme.backend == Backend::Alternate {
            if let Some(failed_at) = self.alternate_failed_at {
                let elapsed = failed_at.elapsed();
                if elapsed < self.cooldown {
                    return Err(FetchError::CoolingDown {
                        remaining: self.cooldown - elapsed,
                    });
                }
            }
        }

        let backend = match theme.backend {
            Backend::Primary => self.config.primary.clone(),
            Backend::Alternate => self.config.alternate.clone(),
        };
        let request = match theme.backend {
            Backend::Primary => {
                TileRequest::primary(&backend.host, theme, key, self.config.keep_alive)
            }
            Backend::Alternate => TileRequest::alternate(&backend.host, theme, key),
        };

        let target = match self.config.proxy.clone() {
            Some(proxy) => Target {
                addr: self.resolve(&proxy.host, proxy.port, None)?,
                port: backend.port,
                via_proxy: true,
            },
            None => Target {
                addr: self.resolve(&backend.host, backend.port, backend.expected_address)?,
                port: backend.port,
                via_proxy: false,
            },
        };

        debug!(%key, request = %request.path_and_query, "downloading tile");
        let buf = self.transport.round_trip(&target, &request)?;
        http::check_image(&buf)?;
        Ok(buf)
    }
}

impl TileFetch for NetworkFetcher {
    fn fetch(&mut self, key: &TileKey) -> Result<Vec<u8>, FetchError> {
        let theme = Theme::from_id(key.tileset).ok_or(FetchError::UnknownTileset(key.tileset))?;
        let backend = theme.backend.as_str();
        metrics::counter!(metric_defs::FETCH_ATTEMPTS.name, "backend" => backend).increment(1);

        let result = self.try_fetch(theme, key);
        match &result {
            Ok(buf) => {
                metrics::counter!(metric_defs::FETCH_BYTES.name).increment(buf.len() as u64);
                if theme.backend == Backend::Alternate {
                    self.alternate_failed_at = None;
                }
                debug!(%key, bytes = buf.len(), "downloaded tile");
            }
            Err(e) => {
                metrics::counter!(
                    metric_defs::FETCH_FAILURES.name,
                    "backend" => backend,
                    "reason" => e.reason()
                )
                .increment(1);
                warn!(%key, backend, code = e.code(), error = %e, "tile download failed");
                if theme.backend == Backend::Alternate
                    && !matches!(e, FetchError::CoolingDown { .. })
                {
                    self.alternate_failed_at = Some(Instant::now());
                }
            }
        }
        result
    }
}
