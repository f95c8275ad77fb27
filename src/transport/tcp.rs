//! `opc.tcp://` endpoints.

use crate::error::{ProtocolError, Result};
use crate::utils::timeout::with_timeout_error;
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, instrument};

/// Port used when an endpoint URL names none.
pub const DEFAULT_PORT: u16 = 4840;

const SCHEME: &str = "opc.tcp://";

/// A parsed `opc.tcp://host[:port][/path]` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUrl {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl EndpointUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .get(..SCHEME.len())
            .filter(|scheme| scheme.eq_ignore_ascii_case(SCHEME))
            .map(|_| &url[SCHEME.len()..])
            .ok_or_else(|| ProtocolError::InvalidEndpoint(format!("not an opc.tcp URL: {url}")))?;

        let (authority, path) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // IPv6 literal
            let end = bracketed
                .find(']')
                .ok_or_else(|| ProtocolError::InvalidEndpoint(format!("unclosed '[' in {url}")))?;
            let host = &bracketed[..end];
            let port = match &bracketed[end + 1..] {
                "" => None,
                p => Some(p.strip_prefix(':').ok_or_else(|| {
                    ProtocolError::InvalidEndpoint(format!("garbage after host in {url}"))
                })?),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(ProtocolError::InvalidEndpoint(format!("missing host in {url}")));
        }
        let port = match port {
            None => DEFAULT_PORT,
            Some(p) => p
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ProtocolError::InvalidEndpoint(format!("invalid port in {url}")))?,
        };

        Ok(EndpointUrl {
            host: host.to_string(),
            port,
            path: path.to_string(),
        })
    }

    /// `host:port` as accepted by [`TcpStream::connect`].
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for EndpointUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}{}{}", self.socket_address(), self.path)
    }
}

/// Resolves and connects to the endpoint, giving up after `timeout`.
#[instrument(skip(endpoint), fields(endpoint = %endpoint))]
pub async fn connect(endpoint: &EndpointUrl, timeout: Duration) -> Result<TcpStream> {
    let address = endpoint.socket_address();
    let stream = with_timeout_error(
        async {
            let stream = TcpStream::connect(&address).await?;
            Ok(stream)
        },
        timeout,
    )
    .await?;
    stream.set_nodelay(true)?;
    debug!(%address, "TCP connection established");
    Ok(stream)
}
