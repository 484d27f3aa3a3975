//! Issuer fetch over mutually authenticated TLS.
//!
//! One fetch is an HTTPS `GET` of the issuer URL. The server certificate must chain to
//! the configured CA bundle and the device presents its own certificate; either check
//! failing aborts the connection. Redirects are followed manually so the configured cap
//! is exact, and the request timeout covers the whole exchange, redirects included.

mod tls;

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, HOST, LOCATION, RETRY_AFTER, USER_AGENT};
use http::{HeaderName, HeaderValue, Method, Request, StatusCode};
use http_body_util::{BodyExt as _, Empty, LengthLimitError, Limited};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::AlertDescription;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use url::{Host, Url};

use crate::config::{Config, IpFamily, IssuerEndpoint};
use crate::interface::{InterfaceBinder, SelectedInterface};
use crate::net::{connect_tcp, is_unreachable};
use crate::prelude::{debug, warn};

/// Header carrying a fresh identifier for every fetch.
const REQUEST_ID_HEADER: &str = "x-midt-request-id";

/// Why the issuer did not deliver a payload.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FetchError {
    /// The URL is not an absolute `https` URL with a host.
    #[error("invalid issuer url: {0}")]
    InvalidUrl(String),

    /// A redirect pointed to a non-`https` location.
    #[error("redirect to insecure location refused: {0}")]
    InsecureRedirect(Url),

    /// The CA bundle, client certificate or key could not be loaded.
    #[error("cannot load tls material from {path}: {reason}")]
    TlsConfig {
        /// Offending file.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The TLS handshake failed for a reason other than certificate validation.
    #[error("tls handshake failed: {0}")]
    TlsHandshakeFailed(String),

    /// The server certificate did not validate, or the server rejected ours.
    #[error("certificate rejected: {0}")]
    CertificateRejected(String),

    /// The request timeout elapsed.
    #[error("issuer request timed out")]
    Timeout,

    /// More redirects than allowed.
    #[error("too many redirects (limit {limit})")]
    TooManyRedirects {
        /// Configured limit.
        limit: u32,
    },

    /// The issuer answered with a non-success status.
    #[error("issuer returned http status {status}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// Server-requested delay before retrying (`Retry-After`, seconds form).
        retry_after: Option<Duration>,
    },

    /// The issuer cannot be reached through the selected interface.
    #[error("network unreachable")]
    NetworkUnreachable(#[source] io::Error),

    /// The TCP connection could not be established or broke.
    #[error("connection failed")]
    Connect(#[source] io::Error),

    /// The HTTP exchange itself failed.
    #[error("http protocol error: {0}")]
    Protocol(String),

    /// The response body exceeds the payload budget.
    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge {
        /// Budget in bytes.
        limit: usize,
    },
}

impl FetchError {
    fn from_io(err: io::Error) -> Self {
        if let Some(tls) = err.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
            return Self::from_tls(tls);
        }
        if is_unreachable(&err) {
            Self::NetworkUnreachable(err)
        } else if err.kind() == io::ErrorKind::TimedOut {
            Self::Timeout
        } else {
            Self::Connect(err)
        }
    }

    fn from_tls(err: &rustls::Error) -> Self {
        match err {
            rustls::Error::InvalidCertificate(_) => Self::CertificateRejected(err.to_string()),
            rustls::Error::AlertReceived(
                AlertDescription::BadCertificate
                | AlertDescription::UnsupportedCertificate
                | AlertDescription::CertificateRevoked
                | AlertDescription::CertificateExpired
                | AlertDescription::CertificateUnknown
                | AlertDescription::CertificateRequired
                | AlertDescription::UnknownCA,
            ) => Self::CertificateRejected(err.to_string()),
            _ => Self::TlsHandshakeFailed(err.to_string()),
        }
    }

    /// Classifies a hyper error by the first I/O or TLS error in its source chain.
    fn from_hyper(err: &hyper::Error) -> Self {
        let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
        while let Some(cause) = source {
            if let Some(tls) = cause.downcast_ref::<rustls::Error>() {
                return Self::from_tls(tls);
            }
            if let Some(io) = cause.downcast_ref::<io::Error>() {
                if let Some(tls) = io.get_ref().and_then(|e| e.downcast_ref::<rustls::Error>()) {
                    return Self::from_tls(tls);
                }
                return Self::from_io(io::Error::new(io.kind(), io.to_string()));
            }
            source = cause.source();
        }
        Self::Protocol(err.to_string())
    }
}

/// Future returned by [`ConfigFetcher::fetch`].
pub type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Bytes, FetchError>> + Send + 'a>>;

/// Retrieves the configuration payload from an issuer URL.
pub trait ConfigFetcher: Send + Sync + 'static {
    /// Fetches `url` through `iface`.
    fn fetch<'a>(&'a self, url: &'a Url, iface: &'a SelectedInterface) -> FetchFuture<'a>;
}

/// Aborts the HTTP connection task when the fetch finishes or is dropped.
struct ConnectionGuard(JoinHandle<()>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Outcome {
    Payload(Bytes),
    Redirect(String),
}

/// mTLS HTTPS client for the issuer.
#[derive(Clone)]
pub struct IssuerFetchClient {
    issuer: IssuerEndpoint,
    identity_headers: Vec<(HeaderName, HeaderValue)>,
    binder: Arc<dyn InterfaceBinder>,
    family: IpFamily,
}

impl std::fmt::Debug for IssuerFetchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuerFetchClient")
            .field("issuer", &self.issuer)
            .field("identity_headers", &self.identity_headers.len())
            .field("binder", &"<InterfaceBinder>")
            .field("family", &self.family)
            .finish()
    }
}

impl IssuerFetchClient {
    /// Creates a client for the issuer settings and device identity in `config`.
    pub fn new(config: &Config, binder: Arc<dyn InterfaceBinder>) -> Self {
        Self {
            issuer: config.behavior.issuer.clone(),
            identity_headers: identity_headers(config),
            binder,
            family: config.behavior.force_ip,
        }
    }

    /// Performs the fetch, bounded by the configured request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] describing the first failure.
    pub async fn fetch(&self, url: &Url, iface: &SelectedInterface) -> Result<Bytes, FetchError> {
        tokio::time::timeout(self.issuer.request_timeout, self.fetch_inner(url, iface))
            .await
            .map_err(|_| FetchError::Timeout)?
    }

    async fn fetch_inner(&self, url: &Url, iface: &SelectedInterface) -> Result<Bytes, FetchError> {
        let tls = tls::client_config(&self.issuer).await?;
        let request_id = request_id();
        let limit = self.issuer.max_redirects.max_follow();

        let mut url = require_https(url.clone())?;
        let mut followed = 0u32;
        loop {
            match self.get_once(&url, &tls, iface, &request_id).await? {
                Outcome::Payload(body) => {
                    debug!("fetched {} byte(s) from {url} via {iface}", body.len());
                    return Ok(body);
                }
                Outcome::Redirect(location) => {
                    if followed >= limit {
                        return Err(FetchError::TooManyRedirects { limit });
                    }
                    followed += 1;

                    let next = url
                        .join(&location)
                        .map_err(|e| FetchError::InvalidUrl(format!("{location}: {e}")))?;
                    if next.scheme() != "https" {
                        return Err(FetchError::InsecureRedirect(next));
                    }
                    debug!("redirect {followed}/{limit}: {url} -> {next}");
                    url = next;
                }
            }
        }
    }

    async fn get_once(
        &self,
        url: &Url,
        tls: &Arc<rustls::ClientConfig>,
        iface: &SelectedInterface,
        request_id: &HeaderValue,
    ) -> Result<Outcome, FetchError> {
        let host = url
            .host()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;

        let (server_name, addrs) = match host {
            Host::Domain(domain) => {
                let name = ServerName::try_from(domain.to_owned())
                    .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
                let addrs = tokio::net::lookup_host((domain, port))
                    .await
                    .map_err(FetchError::from_io)?;
                (name, self.family.filter(addrs))
            }
            Host::Ipv4(ip) => (ServerName::from(IpAddr::V4(ip)), self.family.filter([SocketAddr::new(ip.into(), port)])),
            Host::Ipv6(ip) => (ServerName::from(IpAddr::V6(ip)), self.family.filter([SocketAddr::new(ip.into(), port)])),
        };

        let tcp = self.connect_any(&addrs, iface).await?;
        let tls_stream = TlsConnector::from(Arc::clone(tls))
            .connect(server_name, tcp)
            .await
            .map_err(FetchError::from_io)?;

        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(tls_stream))
                .await
                .map_err(|e| FetchError::from_hyper(&e))?;
        let _guard = ConnectionGuard(tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!("issuer connection closed with error: {err}");
            }
        }));

        let request = self.build_request(url, request_id)?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| FetchError::from_hyper(&e))?;

        let status = response.status();
        if status.is_redirection() {
            if let Some(location) = response.headers().get(LOCATION) {
                let location = location
                    .to_str()
                    .map_err(|_| FetchError::Protocol("non-ascii Location header".into()))?;
                return Ok(Outcome::Redirect(location.to_owned()));
            }
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                retry_after: retry_after(status, response.headers().get(RETRY_AFTER)),
            });
        }

        let budget = self.issuer.payload_budget;
        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > budget as u64) {
            return Err(FetchError::PayloadTooLarge { limit: budget });
        }

        let body = Limited::new(response.into_body(), budget)
            .collect()
            .await
            .map_err(|err| {
                if err.downcast_ref::<LengthLimitError>().is_some() {
                    FetchError::PayloadTooLarge { limit: budget }
                } else if let Some(hyper_err) = err.downcast_ref::<hyper::Error>() {
                    FetchError::from_hyper(hyper_err)
                } else {
                    FetchError::Protocol(err.to_string())
                }
            })?
            .to_bytes();

        Ok(Outcome::Payload(body))
    }

    async fn connect_any(
        &self,
        addrs: &[SocketAddr],
        iface: &SelectedInterface,
    ) -> Result<tokio::net::TcpStream, FetchError> {
        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "issuer has no address in the allowed ip family",
        );
        for &addr in addrs {
            match connect_tcp(self.binder.as_ref(), iface, addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!("connect to {addr} via {iface} failed: {err}");
                    last_err = err;
                }
            }
        }
        Err(FetchError::from_io(last_err))
    }

    fn build_request(
        &self,
        url: &Url,
        request_id: &HeaderValue,
    ) -> Result<Request<Empty<Bytes>>, FetchError> {
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(url.to_string()))?;
        let authority = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        let target = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_owned(),
        };

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(target)
            .header(HOST, authority)
            .header(
                USER_AGENT,
                concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
            )
            .header(REQUEST_ID_HEADER, request_id.clone());
        for (name, value) in &self.identity_headers {
            builder = builder.header(name.clone(), value.clone());
        }

        builder
            .body(Empty::new())
            .map_err(|e| FetchError::Protocol(e.to_string()))
    }
}

impl ConfigFetcher for IssuerFetchClient {
    fn fetch<'a>(&'a self, url: &'a Url, iface: &'a SelectedInterface) -> FetchFuture<'a> {
        Box::pin(IssuerFetchClient::fetch(self, url, iface))
    }
}

fn require_https(url: Url) -> Result<Url, FetchError> {
    if url.scheme() != "https" || url.host().is_none() {
        return Err(FetchError::InvalidUrl(url.to_string()));
    }
    Ok(url)
}

/// Parses `Retry-After` (delta-seconds form) on `429` and `503` responses.
fn retry_after(status: StatusCode, value: Option<&HeaderValue>) -> Option<Duration> {
    if status != StatusCode::TOO_MANY_REQUESTS && status != StatusCode::SERVICE_UNAVAILABLE {
        return None;
    }
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Random 128-bit identifier, hex encoded.
fn request_id() -> HeaderValue {
    let id = format!("{:032x}", fastrand::u128(..));
    HeaderValue::from_str(&id).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

fn identity_headers(config: &Config) -> Vec<(HeaderName, HeaderValue)> {
    let fields = [
        ("x-midt-device-id", &config.identity.device_id),
        ("x-midt-partner-id", &config.identity.partner_id),
        ("x-midt-serial-number", &config.hardware.serial_number),
        ("x-midt-hardware-model", &config.hardware.model),
        ("x-midt-hardware-manufacturer", &config.hardware.manufacturer),
        ("x-midt-firmware-name", &config.firmware.name),
        ("x-midt-last-reboot-reason", &config.hardware.last_reboot_reason),
    ];

    fields
        .into_iter()
        .filter(|(_, value)| !value.is_empty())
        .filter_map(|(name, value)| match HeaderValue::from_bytes(value.as_bytes()) {
            Ok(value) => Some((HeaderName::from_static(name), value)),
            Err(_) => {
                warn!("skipping header {name}: value contains control characters");
                None
            }
        })
        .collect()
}
