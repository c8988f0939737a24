//! One-connection-per-call RESP client over TCP or TLS.
//!
//! Every [`RespClient::command`] opens a fresh socket, runs the optional
//! `AUTH`/`SELECT` preamble, sends the command, reads exactly one reply and
//! drops the connection. There is no pool and no reconnect loop.

use super::resp::{encode_command, parse_one, Reply};
use super::CoordinationBackend;
use crate::error::MeteringError;
use async_trait::async_trait;
use rustls_pki_types::ServerName;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Default backend port.
const DEFAULT_PORT: u16 = 6379;

/// Read chunk size; replies for our commands are tiny.
const READ_CHUNK: usize = 1024;

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// Parsed backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// `rediss://` selects TLS.
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub database: Option<u32>,
}

impl Endpoint {
    /// Parse `redis://[user[:password]@]host[:port][/db]` or the `rediss://` form.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let url = url::Url::parse(raw.trim())
            .map_err(|e| anyhow::anyhow!("Invalid coordination URL: {e}"))?;

        let tls = match url.scheme() {
            "redis" => false,
            "rediss" => true,
            other => anyhow::bail!(
                "Unsupported coordination URL scheme '{other}'. Use redis:// or rediss://"
            ),
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Coordination URL is missing a host"))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();

        let username = Some(decode_component(url.username())?).filter(|u| !u.is_empty());
        let password = match url.password() {
            Some(p) => Some(decode_component(p)?).filter(|p| !p.is_empty()),
            None => None,
        };

        let db_path = url.path().trim_matches('/');
        let database = if db_path.is_empty() {
            None
        } else {
            Some(
                db_path
                    .parse::<u32>()
                    .map_err(|_| anyhow::anyhow!("Invalid database index '{db_path}'"))?,
            )
        };

        Ok(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PORT),
            tls,
            username,
            password,
            database,
        })
    }
}

fn decode_component(raw: &str) -> anyhow::Result<String> {
    Ok(urlencoding::decode(raw)
        .map_err(|e| anyhow::anyhow!("Invalid percent-encoding in coordination URL: {e}"))?
        .into_owned())
}

/// RESP client bound to a single endpoint.
pub struct RespClient {
    endpoint: Endpoint,
    timeout: Duration,
    tls: Option<TlsConnector>,
}

impl RespClient {
    /// Build a client for `url`; `timeout` bounds each call end to end.
    pub fn new(url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = Endpoint::parse(url)?;
        let tls = endpoint.tls.then(tls_connector);
        Ok(Self {
            endpoint,
            timeout,
            tls,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn round_trip(&self, parts: &[&str]) -> Result<Reply, MeteringError> {
        let mut stream = self.connect().await?;

        if let Some(ref password) = self.endpoint.password {
            let reply = match self.endpoint.username {
                Some(ref user) => {
                    exchange(&mut stream, &["AUTH", user.as_str(), password.as_str()]).await?
                }
                None => exchange(&mut stream, &["AUTH", password.as_str()]).await?,
            };
            expect_ok("AUTH", reply)?;
        }
        if let Some(db) = self.endpoint.database {
            let index = db.to_string();
            let reply = exchange(&mut stream, &["SELECT", index.as_str()]).await?;
            expect_ok("SELECT", reply)?;
        }

        let reply = exchange(&mut stream, parts).await;
        let _ = stream.shutdown().await;
        reply
    }

    async fn connect(&self) -> Result<Box<dyn Transport>, MeteringError> {
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        let tcp = TcpStream::connect(addr).await.map_err(|e| {
            MeteringError::unreachable(format!(
                "connect to {}:{} failed: {e}",
                self.endpoint.host, self.endpoint.port
            ))
        })?;
        let _ = tcp.set_nodelay(true);

        let Some(ref connector) = self.tls else {
            return Ok(Box::new(tcp));
        };

        let server_name = ServerName::try_from(self.endpoint.host.clone()).map_err(|e| {
            MeteringError::unreachable(format!("invalid TLS server name: {e}"))
        })?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| MeteringError::unreachable(format!("TLS handshake failed: {e}")))?;
        Ok(Box::new(tls))
    }
}

#[async_trait]
impl CoordinationBackend for RespClient {
    async fn command(&self, parts: &[&str]) -> Result<Reply, MeteringError> {
        let name = parts.first().copied().unwrap_or_default();
        match tokio::time::timeout(self.timeout, self.round_trip(parts)).await {
            Ok(result) => result,
            Err(_) => Err(MeteringError::unreachable(format!(
                "{name} timed out after {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

/// Write one command and read until one complete reply has arrived.
async fn exchange<S>(stream: &mut S, parts: &[&str]) -> Result<Reply, MeteringError>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&encode_command(parts))
        .await
        .map_err(|e| MeteringError::unreachable(format!("write failed: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| MeteringError::unreachable(format!("flush failed: {e}")))?;

    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let Some((reply, _)) = parse_one(&buf, 0)? {
            return Ok(reply);
        }
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| MeteringError::unreachable(format!("read failed: {e}")))?;
        if n == 0 {
            return Err(MeteringError::unreachable(
                "connection closed before a complete reply",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn expect_ok(command: &str, reply: Reply) -> Result<(), MeteringError> {
    match reply {
        r if r.is_ok() => Ok(()),
        Reply::Error(msg) => Err(MeteringError::unreachable(format!("{command} rejected: {msg}"))),
        other => Err(MeteringError::UnexpectedReply {
            command: command.to_string(),
            reply: other.to_string(),
        }),
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}
