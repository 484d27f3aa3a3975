//! TLS client configuration for the issuer connection.
//!
//! Material is re-read on every attempt so a rotated certificate or CA bundle is picked
//! up without a restart.

use std::io::{BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, SupportedProtocolVersion};
use zeroize::Zeroizing;

use super::FetchError;
use crate::config::{IssuerEndpoint, TlsVersion};
use crate::prelude::debug;

static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];
static TLS12_AND_UP: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Protocol versions allowed for a configured floor.
///
/// TLS 1.0 and 1.1 are not implemented, so those floors behave like 1.2.
pub(crate) fn protocol_versions(floor: TlsVersion) -> &'static [&'static SupportedProtocolVersion] {
    match floor {
        TlsVersion::V1_0 | TlsVersion::V1_1 | TlsVersion::V1_2 => TLS12_AND_UP,
        TlsVersion::V1_3 | TlsVersion::Max => TLS13_ONLY,
    }
}

/// The process-default provider if the application installed one, ring otherwise.
fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()))
}

/// Builds the mTLS client configuration from the files named in `issuer`.
///
/// Only the CA bundle is trusted for the server certificate; system roots are not used.
pub(crate) async fn client_config(issuer: &IssuerEndpoint) -> Result<Arc<ClientConfig>, FetchError> {
    let roots = load_roots(&issuer.ca_bundle_path).await?;
    let chain = load_cert_chain(&issuer.mtls.cert_path).await?;
    let key = load_private_key(&issuer.mtls.private_key_path).await?;

    let config = ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(protocol_versions(issuer.tls_version))
        .map_err(|e| tls_config_error(&issuer.ca_bundle_path, e))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| tls_config_error(&issuer.mtls.private_key_path, e))?;

    Ok(Arc::new(config))
}

fn tls_config_error(path: &Path, reason: impl std::fmt::Display) -> FetchError {
    FetchError::TlsConfig {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

async fn read_file(path: &Path) -> Result<Zeroizing<Vec<u8>>, FetchError> {
    tokio::fs::read(path)
        .await
        .map(Zeroizing::new)
        .map_err(|e| tls_config_error(path, e))
}

fn parse_certs(path: &Path, pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, FetchError> {
    let mut reader = BufReader::new(Cursor::new(pem));
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_config_error(path, e))?;
    if certs.is_empty() {
        return Err(tls_config_error(path, "no certificates found"));
    }
    Ok(certs)
}

async fn load_roots(path: &Path) -> Result<RootCertStore, FetchError> {
    let pem = read_file(path).await?;
    let certs = parse_certs(path, &pem)?;

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs);
    debug!("loaded {added} CA certificate(s) from {} ({ignored} ignored)", path.display());

    if store.is_empty() {
        return Err(tls_config_error(path, "no usable CA certificates"));
    }
    Ok(store)
}

async fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, FetchError> {
    let pem = read_file(path).await?;
    parse_certs(path, &pem)
}

async fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, FetchError> {
    let pem = read_file(path).await?;
    let mut reader = BufReader::new(Cursor::new(pem.as_slice()));
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_config_error(path, e))?
        .ok_or_else(|| tls_config_error(path, "no private key found"))
}
