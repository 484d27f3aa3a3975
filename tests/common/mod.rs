#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use device_bootstrap::{Config, JwtAlg, TrustAnchor, TrustStore};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use p256::ecdsa::SigningKey;
use p256::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
use rand_core::OsRng;
use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

/// An ES256 signing key with its public half in PEM form.
pub struct Signer {
    pub encoding_key: EncodingKey,
    pub public_pem: String,
}

impl Signer {
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let pkcs8 = signing_key.to_pkcs8_der().expect("pkcs8 encode");
        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("public pem encode");
        Self {
            encoding_key: EncodingKey::from_ec_der(pkcs8.as_bytes()),
            public_pem,
        }
    }

    pub fn anchor(&self, kid: Option<&str>) -> TrustAnchor {
        TrustAnchor::from_pem(JwtAlg::ES256, kid, self.public_pem.as_bytes()).expect("anchor")
    }

    pub fn store(&self) -> Arc<TrustStore> {
        Arc::new(TrustStore::from_anchors([self.anchor(None)]).expect("store"))
    }

    /// Signs a discovery token pointing at `endpoint`, valid for the next hour.
    pub fn token(&self, endpoint: &str) -> String {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let claims = json!({ "endpoint": endpoint, "nbf": now - 60, "exp": now + 3600 });
        encode(&Header::new(Algorithm::ES256), &claims, &self.encoding_key).expect("sign")
    }
}

/// Builds a validated configuration from a `behavior` object.
pub fn config(behavior: serde_json::Value) -> Config {
    let doc = json!({
        "identity": { "device_id": "mac:11:22:33:44:55:66", "partner_id": "acme" },
        "hardware": { "model": "X1", "serial_number": "SN-1", "manufacturer": "Acme", "last_reboot_reason": "power-on" },
        "firmware": { "name": "fw-1.2.3" },
        "behavior": behavior,
    });
    Config::from_json_slice(&serde_json::to_vec(&doc).expect("json")).expect("valid config")
}

/// A throw-away CA with one server and one client certificate, written to disk.
pub struct TlsFixtures {
    pub dir: TempDir,
    pub ca_path: PathBuf,
    pub client_cert_path: PathBuf,
    pub client_key_path: PathBuf,
    pub server_config: Arc<ServerConfig>,
}

impl TlsFixtures {
    pub fn generate() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");

        let ca_key = KeyPair::generate().expect("ca key");
        let ca_cert = ca_params().self_signed(&ca_key).expect("ca cert");
        let ca_path = dir.path().join("ca.pem");
        std::fs::write(&ca_path, ca_cert.pem()).expect("write ca");

        let (server_cert, server_key) = leaf(&ca_cert, &ca_key, "issuer.test");
        let (client_cert, client_key) = leaf(&ca_cert, &ca_key, "device.test");

        let client_cert_path = dir.path().join("client.pem");
        let client_key_path = dir.path().join("client.key");
        std::fs::write(&client_cert_path, client_cert.pem()).expect("write client cert");
        std::fs::write(&client_key_path, client_key.serialize_pem()).expect("write client key");

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut roots = RootCertStore::empty();
        roots.add(ca_cert.der().clone()).expect("add ca");
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .expect("client verifier");

        let server_config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("protocol versions")
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                vec![server_cert.der().clone()],
                PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
            )
            .expect("server config");

        Self {
            dir,
            ca_path,
            client_cert_path,
            client_key_path,
            server_config: Arc::new(server_config),
        }
    }

    /// `issuer` settings for a JSON configuration trusting this CA.
    pub fn issuer(&self, url: &str, max_redirects: i64) -> serde_json::Value {
        json!({
            "url": url,
            "request_timeout": 10,
            "max_redirects": max_redirects,
            "tls_version": "1.2",
            "ca_bundle_path": self.ca_path,
            "mtls": {
                "cert_path": self.client_cert_path,
                "private_key_path": self.client_key_path,
            },
        })
    }
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = {
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(DnType::CommonName, "bootstrap-test-ca");
        dn
    };
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
}

fn leaf(ca_cert: &Certificate, ca_key: &KeyPair, name: &str) -> (Certificate, KeyPair) {
    let key = KeyPair::generate().expect("leaf key");
    let mut params = CertificateParams::new(vec![name.to_owned(), "localhost".to_owned()])
        .expect("leaf params");
    params.distinguished_name.push(DnType::CommonName, name);
    let cert = params.signed_by(&key, ca_cert, ca_key).expect("leaf cert");
    (cert, key)
}

/// A request as seen by [`HttpsServer`].
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal HTTPS/1.1 server requiring client certificates. One request per connection.
pub struct HttpsServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<SeenRequest>>>,
    task: JoinHandle<()>,
}

impl HttpsServer {
    pub async fn start<F>(config: Arc<ServerConfig>, respond: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let acceptor = TlsAcceptor::from(config);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let respond = Arc::new(respond);

        let seen = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                let respond = Arc::clone(&respond);
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let Ok(mut tls) = acceptor.accept(tcp).await else {
                        return;
                    };
                    let Some(request) = read_request(&mut tls).await else {
                        return;
                    };
                    let response = respond(&request.path);
                    seen.lock().unwrap().push(request);
                    let _ = tls.write_all(response.as_bytes()).await;
                    let _ = tls.shutdown().await;
                });
            }
        });

        Self {
            addr,
            requests,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("https://localhost:{}{path}", self.addr.port())
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for HttpsServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request<S: AsyncReadExt + Unpin>(stream: &mut S) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.split("\r\n");
    let path = lines.next()?.split(' ').nth(1)?.to_owned();
    let headers = lines
        .take_while(|l| !l.is_empty())
        .filter_map(|l| l.split_once(':'))
        .map(|(n, v)| (n.trim().to_owned(), v.trim().to_owned()))
        .collect();
    Some(SeenRequest { path, headers })
}

pub fn ok(body: &str) -> String {
    format!(
        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}

pub fn redirect(location: &str) -> String {
    format!(
        "HTTP/1.1 302 Found\r\nlocation: {location}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
    )
}

pub fn status(code: u16, reason: &str, extra_headers: &str) -> String {
    format!(
        "HTTP/1.1 {code} {reason}\r\n{extra_headers}content-length: 0\r\nconnection: close\r\n\r\n"
    )
}

/// Accepts TCP connections and never speaks TLS.
pub async fn silent_listener() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((tcp, _)) = listener.accept().await {
            held.push(tcp);
        }
    });
    (addr, task)
}
