//! Verification of discovery tokens.
//!
//! DNS answers are untrusted. A TXT record only becomes useful once it parses as a
//! compact JWT whose declared algorithm is in the configured allow-list and whose
//! signature verifies against a [`TrustAnchor`](crate::TrustAnchor) loaded before the
//! attempt started.
//!
//! ## Validation policy
//!
//! - **Algorithm**: the `alg` header must be in the allow-list. This is checked before any
//!   key is touched; there is no fallback to other algorithms.
//! - **Signature**: verified with every anchor selected for the header's `alg`/`kid`.
//! - **Expiry (`exp`)**: required; the token is rejected at or after `exp`. No leeway.
//! - **Not before (`nbf`)**: optional; the token is rejected before `nbf`. No leeway.
//! - **Issuer URL (`endpoint`)**: required; must be an absolute `https` URL.
//!
//! Candidates are tried in received order, followed by the token reassembled from
//! chunked records (if any). The first candidate that passes every check wins.

pub(crate) mod alg;
mod chunks;

pub use alg::{JwtAlg, UnsupportedAlgorithm};

use std::sync::Arc;

use base64ct::{Base64UrlUnpadded, Encoding as _};
use serde::Deserialize;
use serde_json::Number;
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

use crate::prelude::debug;
use crate::trust_store::TrustStore;

/// Maximum size for a JWT segment (header or claims) after base64url decoding.
const MAX_JWT_SEGMENT_SIZE: usize = 64 * 1024;

/// Maximum length of a whole candidate token. 100 chunks of one TXT string each.
const MAX_JWT_TOKEN_LEN: usize = 100 * 255;

/// Name of the claim carrying the issuer URL.
const ISSUER_URL_CLAIM: &str = "endpoint";

/// Why no discovery record produced a [`VerifiedClaim`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum VerificationError {
    /// No candidate parsed as a JWT, or none verified against the trust store.
    #[error("no valid token in discovery records")]
    NoValidToken,

    /// Every JWT candidate declared an algorithm outside the allow-list.
    #[error("all tokens use algorithms outside the allow-list")]
    AllAlgorithmsRejected,

    /// The first verified token is expired.
    #[error("token expired at {expires_at}")]
    Expired {
        /// Value of the `exp` claim.
        expires_at: OffsetDateTime,
    },

    /// The first verified token is not valid yet.
    #[error("token not valid before {not_before}")]
    NotYetValid {
        /// Value of the `nbf` claim.
        not_before: OffsetDateTime,
    },

    /// The first verified token lacks a required claim or carries an invalid one.
    #[error("malformed token claims: {0}")]
    MalformedClaims(String),
}

/// Result of a successful verification: where to fetch the configuration from, and
/// for how long that answer holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaim {
    issuer_url: Url,
    not_before: Option<OffsetDateTime>,
    expires_at: OffsetDateTime,
    alg: JwtAlg,
    kid: Option<String>,
}

impl VerifiedClaim {
    /// The issuer URL (from the `endpoint` claim).
    pub const fn issuer_url(&self) -> &Url {
        &self.issuer_url
    }

    /// Start of the validity window (from the `nbf` claim), if present.
    pub const fn not_before(&self) -> Option<OffsetDateTime> {
        self.not_before
    }

    /// End of the validity window (from the `exp` claim).
    pub const fn expires_at(&self) -> OffsetDateTime {
        self.expires_at
    }

    /// Algorithm that verified the token.
    pub const fn algorithm(&self) -> JwtAlg {
        self.alg
    }

    /// Key ID from the token header, if any.
    pub fn key_id(&self) -> Option<&str> {
        self.kid.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct Header {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
    #[serde(default)]
    typ: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    exp: Option<Number>,
    #[serde(default)]
    nbf: Option<Number>,
}

/// Outcome of checking a single candidate.
#[derive(Debug)]
enum Rejection {
    NotJwt,
    AlgorithmRejected,
    BadSignature,
    Claims(VerificationError),
}

/// Structurally parsed, still untrusted token.
struct Candidate<'a> {
    signing_input: &'a str,
    signature: &'a str,
    header: Header,
    claims_json: Vec<u8>,
}

/// Verifies discovery records against a shared [`TrustStore`] and an algorithm allow-list.
#[derive(Debug, Clone)]
pub struct JwtVerifier {
    trust: Arc<TrustStore>,
    allowed: Vec<JwtAlg>,
}

impl JwtVerifier {
    /// Creates a verifier.
    ///
    /// An empty allow-list is representable but rejects everything.
    pub fn new(trust: Arc<TrustStore>, allowed: &[JwtAlg]) -> Self {
        Self {
            trust,
            allowed: allowed.to_vec(),
        }
    }

    /// Returns the configured allow-list.
    pub fn allowed_algorithms(&self) -> &[JwtAlg] {
        &self.allowed
    }

    /// Picks the first record that verifies and is valid at `now`.
    ///
    /// # Errors
    ///
    /// - [`VerificationError::AllAlgorithmsRejected`] if every JWT-shaped record declared
    ///   an algorithm outside the allow-list.
    /// - [`VerificationError::Expired`], [`VerificationError::NotYetValid`] or
    ///   [`VerificationError::MalformedClaims`] for the first record whose signature
    ///   verified but whose claims did not pass.
    /// - [`VerificationError::NoValidToken`] otherwise.
    pub fn verify<S: AsRef<str>>(
        &self,
        records: &[S],
        now: OffsetDateTime,
    ) -> Result<VerifiedClaim, VerificationError> {
        let reassembled = chunks::reassemble(records);
        let candidates = records
            .iter()
            .map(|r| r.as_ref().trim())
            .chain(reassembled.as_deref());

        let mut jwt_shaped = 0usize;
        let mut alg_rejected = 0usize;
        let mut first_claims_error: Option<VerificationError> = None;

        for (index, token) in candidates.enumerate() {
            match self.check(token, now) {
                Ok(claim) => {
                    debug!(
                        "discovery record {index} verified (alg={}, kid={:?})",
                        claim.alg, claim.kid
                    );
                    return Ok(claim);
                }
                Err(Rejection::NotJwt) => {}
                Err(Rejection::AlgorithmRejected) => {
                    jwt_shaped += 1;
                    alg_rejected += 1;
                    debug!("discovery record {index} rejected: algorithm not allowed");
                }
                Err(Rejection::BadSignature) => {
                    jwt_shaped += 1;
                    debug!("discovery record {index} rejected: signature did not verify");
                }
                Err(Rejection::Claims(err)) => {
                    jwt_shaped += 1;
                    debug!("discovery record {index} rejected: {err}");
                    first_claims_error.get_or_insert(err);
                }
            }
        }

        if jwt_shaped > 0 && alg_rejected == jwt_shaped {
            return Err(VerificationError::AllAlgorithmsRejected);
        }
        Err(first_claims_error.unwrap_or(VerificationError::NoValidToken))
    }

    fn check(&self, token: &str, now: OffsetDateTime) -> Result<VerifiedClaim, Rejection> {
        let candidate = parse_candidate(token).ok_or(Rejection::NotJwt)?;

        let alg = JwtAlg::parse(&candidate.header.alg)
            .filter(|alg| self.allowed.contains(alg))
            .ok_or(Rejection::AlgorithmRejected)?;

        let anchors = self.trust.anchors_for(alg, candidate.header.kid.as_deref());

        // Every selected anchor is tried so the time spent does not depend on which one matched.
        let mut verified = false;
        for anchor in &anchors {
            let ok = jsonwebtoken::crypto::verify(
                candidate.signature,
                candidate.signing_input.as_bytes(),
                anchor.decoding_key(),
                alg.to_jsonwebtoken(),
            )
            .unwrap_or(false);
            verified |= ok;
        }
        if !verified {
            return Err(Rejection::BadSignature);
        }

        let claim = build_claim(&candidate, alg).map_err(Rejection::Claims)?;

        if now >= claim.expires_at {
            return Err(Rejection::Claims(VerificationError::Expired {
                expires_at: claim.expires_at,
            }));
        }
        if let Some(not_before) = claim.not_before {
            if now < not_before {
                return Err(Rejection::Claims(VerificationError::NotYetValid { not_before }));
            }
        }

        Ok(claim)
    }
}

fn parse_candidate(token: &str) -> Option<Candidate<'_>> {
    if token.is_empty() || token.len() > MAX_JWT_TOKEN_LEN {
        return None;
    }

    let (signing_input, signature) = token.rsplit_once('.')?;
    let (header_b64, claims_b64) = signing_input.split_once('.')?;
    if header_b64.is_empty() || claims_b64.is_empty() || signature.is_empty() {
        return None;
    }
    if claims_b64.contains('.') {
        return None;
    }

    let header: Header = serde_json::from_slice(&decode_b64url_to_vec(header_b64)?).ok()?;
    if let Some(typ) = header.typ.as_deref() {
        if !typ.eq_ignore_ascii_case("JWT") && !typ.eq_ignore_ascii_case("JOSE") {
            return None;
        }
    }
    let claims_json = decode_b64url_to_vec(claims_b64)?;

    Some(Candidate {
        signing_input,
        signature,
        header,
        claims_json,
    })
}

fn build_claim(candidate: &Candidate<'_>, alg: JwtAlg) -> Result<VerifiedClaim, VerificationError> {
    let malformed = |reason: &str| VerificationError::MalformedClaims(reason.to_owned());

    let claims: Claims = serde_json::from_slice(&candidate.claims_json)
        .map_err(|e| VerificationError::MalformedClaims(e.to_string()))?;

    let endpoint = claims
        .endpoint
        .ok_or_else(|| malformed("missing 'endpoint' claim"))?;
    let issuer_url = Url::parse(&endpoint).map_err(|_| malformed("'endpoint' is not a url"))?;
    if issuer_url.scheme() != "https" || issuer_url.host_str().is_none() {
        return Err(malformed("'endpoint' must be an https url with a host"));
    }

    let exp = claims.exp.ok_or_else(|| malformed("missing 'exp' claim"))?;
    let expires_at = numeric_date(&exp).ok_or_else(|| malformed("invalid 'exp' claim"))?;
    let not_before = claims
        .nbf
        .map(|nbf| numeric_date(&nbf).ok_or_else(|| malformed("invalid 'nbf' claim")))
        .transpose()?;

    Ok(VerifiedClaim {
        issuer_url,
        not_before,
        expires_at,
        alg,
        kid: candidate.header.kid.clone(),
    })
}

/// Converts a JWT NumericDate (seconds, possibly fractional) into a timestamp.
#[allow(clippy::cast_possible_truncation)]
fn numeric_date(value: &Number) -> Option<OffsetDateTime> {
    let secs = match value.as_i64() {
        Some(secs) => secs,
        None => {
            let secs = value.as_f64().filter(|f| f.is_finite())?.floor();
            if secs < i64::MIN as f64 || secs > i64::MAX as f64 {
                return None;
            }
            secs as i64
        }
    };
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

/// Decode base64url (no padding) into bytes, bounded by [`MAX_JWT_SEGMENT_SIZE`].
fn decode_b64url_to_vec(input: &str) -> Option<Vec<u8>> {
    // Base64url encoding expands data by ~33%, so the encoded size gives an upper bound.
    if input.len() > MAX_JWT_SEGMENT_SIZE * 4 / 3 {
        return None;
    }

    let mut buf = vec![0u8; input.len()];
    let len = Base64UrlUnpadded::decode(input, &mut buf).ok()?.len();
    if len > MAX_JWT_SEGMENT_SIZE {
        return None;
    }

    buf.truncate(len);
    Some(buf)
}
