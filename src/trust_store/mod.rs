//! Verification keys for discovery tokens.
//!
//! Keys are loaded once from a directory and never change afterwards. Naming convention
//! inside the directory:
//!
//! - `<ALG>.pem` holds one or more PEM public keys for `<ALG>` that are not bound to a key ID.
//! - `<ALG>.<kid>.pem` holds exactly one PEM public key bound to key ID `<kid>`.
//!
//! Every allowed algorithm needs at least one of those files.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{BufReader, Cursor};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64ct::{Base64, Encoding as _};
use jsonwebtoken::DecodingKey;
use thiserror::Error;

use crate::jwt::alg::KeyFamily;
use crate::jwt::JwtAlg;
use crate::prelude::{debug, info};

/// A pre-provisioned verification key.
#[derive(Clone)]
pub struct TrustAnchor {
    alg: JwtAlg,
    kid: Option<Arc<str>>,
    key: DecodingKey,
}

impl fmt::Debug for TrustAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustAnchor")
            .field("alg", &self.alg)
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

impl TrustAnchor {
    /// Builds an anchor from a single PEM-encoded public key.
    ///
    /// EC and Ed keys must be SPKI (`PUBLIC KEY`); RSA keys may also be PKCS#1
    /// (`RSA PUBLIC KEY`).
    ///
    /// # Errors
    ///
    /// Returns the decoding error if the PEM is malformed or the key type does not
    /// match the algorithm family.
    pub fn from_pem(
        alg: JwtAlg,
        kid: Option<&str>,
        pem: &[u8],
    ) -> Result<Self, jsonwebtoken::errors::Error> {
        let key = match alg.family() {
            KeyFamily::Ec => DecodingKey::from_ec_pem(pem)?,
            KeyFamily::Rsa => DecodingKey::from_rsa_pem(pem)?,
            KeyFamily::Ed => DecodingKey::from_ed_pem(pem)?,
        };

        Ok(Self {
            alg,
            kid: kid.map(Arc::from),
            key,
        })
    }

    /// Returns the algorithm this key verifies.
    pub const fn algorithm(&self) -> JwtAlg {
        self.alg
    }

    /// Returns the key ID, if the key is bound to one.
    pub fn key_id(&self) -> Option<&str> {
        self.kid.as_deref()
    }

    pub(crate) const fn decoding_key(&self) -> &DecodingKey {
        &self.key
    }
}

/// Errors raised while loading a [`TrustStore`]. All of them are fatal at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TrustStoreError {
    /// No algorithm was requested.
    #[error("no jwt algorithms configured")]
    EmptyAlgorithmList,

    /// The keys directory could not be listed.
    #[error("cannot read keys directory {path}")]
    ReadDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// No key file exists for an allowed algorithm.
    #[error("no key file for algorithm {alg} (expected {path})")]
    MissingKeyFile {
        /// Algorithm lacking keys.
        alg: JwtAlg,
        /// Expected file path.
        path: PathBuf,
    },

    /// A key file could not be read.
    #[error("cannot read key file {path}")]
    ReadFile {
        /// File path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A key file holds no PEM block.
    #[error("key file {path} contains no PEM key")]
    NoKeysInFile {
        /// File path.
        path: PathBuf,
    },

    /// A key file holds a PEM section that cannot be decoded.
    #[error("malformed PEM in key file {path}")]
    MalformedPem {
        /// File path.
        path: PathBuf,
        /// Parser error.
        #[source]
        source: std::io::Error,
    },

    /// A key-ID-bound file holds more than one PEM block.
    #[error("key file {path} must contain exactly one PEM key")]
    MultipleKeysForKid {
        /// File path.
        path: PathBuf,
    },

    /// A PEM block is malformed or does not match the algorithm's key type.
    #[error("invalid {alg} key in {path}")]
    InvalidKey {
        /// File path.
        path: PathBuf,
        /// Algorithm the key was loaded for.
        alg: JwtAlg,
        /// Decoding error.
        #[source]
        source: jsonwebtoken::errors::Error,
    },

    /// Two anchors for the same algorithm share a key ID.
    #[error("duplicate key id '{kid}' for algorithm {alg}")]
    DuplicateKeyId {
        /// Algorithm.
        alg: JwtAlg,
        /// Duplicated key ID.
        kid: String,
    },
}

#[derive(Debug, Clone, Default)]
struct AlgorithmAnchors {
    unbound: Vec<Arc<TrustAnchor>>,
    by_kid: HashMap<Arc<str>, Arc<TrustAnchor>>,
}

impl AlgorithmAnchors {
    fn len(&self) -> usize {
        self.unbound.len() + self.by_kid.len()
    }
}

/// Immutable set of [`TrustAnchor`]s keyed by algorithm and key ID.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    anchors: HashMap<JwtAlg, AlgorithmAnchors>,
}

impl TrustStore {
    /// Loads keys for each algorithm in `algs` from `dir`.
    ///
    /// Files for algorithms that are not requested are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError`] if `algs` is empty, the directory cannot be listed,
    /// an algorithm has no key file, or any key file is unreadable or malformed.
    pub fn load_from_dir(dir: impl AsRef<Path>, algs: &[JwtAlg]) -> Result<Self, TrustStoreError> {
        let dir = dir.as_ref();
        if algs.is_empty() {
            return Err(TrustStoreError::EmptyAlgorithmList);
        }

        let mut file_names: Vec<String> = fs::read_dir(dir)
            .and_then(|entries| {
                entries
                    .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
                    .collect()
            })
            .map_err(|source| TrustStoreError::ReadDir {
                path: dir.to_path_buf(),
                source,
            })?;
        file_names.sort();

        let mut wanted = algs.to_vec();
        wanted.sort();
        wanted.dedup();

        let mut anchors = Vec::new();
        for alg in wanted {
            let before = anchors.len();
            let shared = format!("{alg}.pem");
            let prefix = format!("{alg}.");

            for name in &file_names {
                let path = dir.join(name);
                if *name == shared {
                    let pem = read_key_file(&path)?;
                    let blocks = public_key_pems(&pem, &path)?;
                    if blocks.is_empty() {
                        return Err(TrustStoreError::NoKeysInFile { path });
                    }
                    for block in &blocks {
                        anchors.push(anchor_from_block(alg, None, block, &path)?);
                    }
                    continue;
                }

                let kid = name
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(".pem"))
                    .filter(|kid| !kid.is_empty());
                let Some(kid) = kid else { continue };

                let pem = read_key_file(&path)?;
                match public_key_pems(&pem, &path)?.as_slice() {
                    [] => return Err(TrustStoreError::NoKeysInFile { path }),
                    [block] => anchors.push(anchor_from_block(alg, Some(kid), block, &path)?),
                    _ => return Err(TrustStoreError::MultipleKeysForKid { path }),
                }
            }

            if anchors.len() == before {
                return Err(TrustStoreError::MissingKeyFile {
                    alg,
                    path: dir.join(shared),
                });
            }
            debug!(
                "loaded {} trust anchor(s) for {alg} from {}",
                anchors.len() - before,
                dir.display()
            );
        }

        let store = Self::from_anchors(anchors)?;
        info!(
            "trust store loaded: {} anchor(s) for {} algorithm(s)",
            store.len(),
            store.anchors.len()
        );
        Ok(store)
    }

    /// Builds a store from already-decoded anchors.
    ///
    /// # Errors
    ///
    /// Returns [`TrustStoreError::DuplicateKeyId`] if two anchors of the same algorithm
    /// share a key ID.
    pub fn from_anchors(
        anchors: impl IntoIterator<Item = TrustAnchor>,
    ) -> Result<Self, TrustStoreError> {
        let mut store = Self::default();
        for anchor in anchors {
            let slot = store.anchors.entry(anchor.alg).or_default();
            match anchor.kid.clone() {
                None => slot.unbound.push(Arc::new(anchor)),
                Some(kid) => {
                    if slot.by_kid.contains_key(&kid) {
                        return Err(TrustStoreError::DuplicateKeyId {
                            alg: anchor.alg,
                            kid: kid.to_string(),
                        });
                    }
                    slot.by_kid.insert(kid, Arc::new(anchor));
                }
            }
        }
        Ok(store)
    }

    /// Returns the anchors that may verify a token declaring `alg` and `kid`.
    ///
    /// A known `kid` selects exactly its anchor. Otherwise every anchor of the
    /// algorithm is returned: unbound anchors first, then bound ones ordered by key ID.
    pub fn anchors_for(&self, alg: JwtAlg, kid: Option<&str>) -> Vec<Arc<TrustAnchor>> {
        let Some(slot) = self.anchors.get(&alg) else {
            return Vec::new();
        };

        if let Some(anchor) = kid.and_then(|kid| slot.by_kid.get(kid)) {
            return vec![Arc::clone(anchor)];
        }

        let mut bound: Vec<&Arc<TrustAnchor>> = slot.by_kid.values().collect();
        bound.sort_by(|a, b| a.kid.cmp(&b.kid));

        slot.unbound
            .iter()
            .chain(bound)
            .map(Arc::clone)
            .collect()
    }

    /// Returns `true` if at least one anchor exists for `alg`.
    pub fn has_algorithm(&self, alg: JwtAlg) -> bool {
        self.anchors.get(&alg).is_some_and(|slot| slot.len() > 0)
    }

    /// Total number of anchors.
    pub fn len(&self) -> usize {
        self.anchors.values().map(AlgorithmAnchors::len).sum()
    }

    /// Returns `true` if the store holds no anchor.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_key_file(path: &Path) -> Result<String, TrustStoreError> {
    fs::read_to_string(path).map_err(|source| TrustStoreError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

fn anchor_from_block(
    alg: JwtAlg,
    kid: Option<&str>,
    block: &str,
    path: &Path,
) -> Result<TrustAnchor, TrustStoreError> {
    TrustAnchor::from_pem(alg, kid, block.as_bytes()).map_err(|source| {
        TrustStoreError::InvalidKey {
            path: path.to_path_buf(),
            alg,
            source,
        }
    })
}

/// PEM public keys in `text`: every SPKI `PUBLIC KEY` block, then every PKCS#1
/// `RSA PUBLIC KEY` block.
///
/// SPKI blocks go through `rustls-pemfile` and are re-armoured for the JWT backend.
/// `rustls-pemfile` skips `RSA PUBLIC KEY` sections, so those are located by label.
fn public_key_pems(text: &str, path: &Path) -> Result<Vec<String>, TrustStoreError> {
    let mut reader = BufReader::new(Cursor::new(text.as_bytes()));
    let mut pems = rustls_pemfile::public_keys(&mut reader)
        .map(|spki| spki.map(|der| armour(SPKI_LABEL, der.as_ref())))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TrustStoreError::MalformedPem {
            path: path.to_path_buf(),
            source,
        })?;
    pems.extend(pkcs1_blocks(text).into_iter().map(str::to_owned));
    Ok(pems)
}

const SPKI_LABEL: &str = "PUBLIC KEY";
const PKCS1_BEGIN: &str = "-----BEGIN RSA PUBLIC KEY-----";
const PKCS1_END: &str = "-----END RSA PUBLIC KEY-----";

fn pkcs1_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(PKCS1_BEGIN) {
        let block = &rest[start..];
        let Some(end) = block.find(PKCS1_END) else { break };
        let len = end + PKCS1_END.len();
        blocks.push(&block[..len]);
        rest = &block[len..];
    }
    blocks
}

fn armour(label: &str, der: &[u8]) -> String {
    let body = Base64::encode_string(der);
    let mut pem = format!("-----BEGIN {label}-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}
