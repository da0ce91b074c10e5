//! Role <-> address/keyfile registry.
//!
//! The addressbook maps arbitrary role names ("hot", "server", "admin", ...)
//! to on-chain addresses and, when permitted, to the keyfile that can sign
//! for them. It is loaded once per process and re-read only on explicit
//! [`Addressbook::refresh`]; mutations are handed off to an external writer
//! ([`AddressbookWriter`]) that performs the atomic file replacement and
//! owns file permissions — this component never writes the file directly.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::address::{AddressCodec, InternalAddress, PublicKeyIndex, is_internal};
use crate::wallet::{Wallet, WalletError, WalletResolver};

static ROLE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]{1,32}$").expect("regex"));

/// Validates a role name for new-entry APIs: `^[A-Za-z0-9_]{1,32}$`.
pub fn is_valid_role_name(role: &str) -> bool {
    ROLE_RE.is_match(role)
}

/// Errors resolving an id (address or role) or a role's wallet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressbookError {
    #[error("could not resolve '{0}' to an address")]
    Unresolvable(String),
    #[error("no role named '{0}' in the addressbook")]
    NoRole(String),
    #[error("role '{0}' has no keyfile and is read-only")]
    NoKeyfile(String),
    #[error("keyfile for role '{0}' is missing or unreadable")]
    KeyfileMissing(String),
}

/// One role's entry: its address and, when the role can sign, its keyfile.
/// An entry without `keyfile` is read-only — it can receive but not sign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressbookEntry {
    pub address: InternalAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<PathBuf>,
}

/// An ordered-insertion-irrelevant mapping from role to entry.
#[derive(Debug, Clone, Default)]
pub struct Addressbook {
    entries: HashMap<String, AddressbookEntry>,
}

/// Hands mutations off to the root-agent IPC that owns the addressbook file
/// on disk: atomic temp-file + rename replacement and file permissions.
/// This component only *requests* writes.
#[async_trait]
pub trait AddressbookWriter: Send + Sync {
    async fn write(&self, book: &Addressbook) -> std::io::Result<()>;
    /// Asks the external agent to generate a fresh hot wallet (mnemonic +
    /// keyfile) and report back its entry.
    async fn generate_hot_wallet(&self) -> std::io::Result<(String, AddressbookEntry)>;
}

/// A minimal [`AddressbookWriter`] that persists the book to a JSON file
/// atomically. Real deployments route writes through the root-agent IPC
/// named in the spec (out of scope here); this is the in-process stand-in
/// used when no such agent is configured.
pub struct FileAddressbookWriter {
    path: PathBuf,
}

impl FileAddressbookWriter {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl AddressbookWriter for FileAddressbookWriter {
    async fn write(&self, book: &Addressbook) -> std::io::Result<()> {
        let serializable: HashMap<&str, &AddressbookEntry> =
            book.entries.iter().map(|(k, v)| (k.as_str(), v)).collect();
        crate::persist::write_json_atomic(&self.path, &serializable).await
    }

    async fn generate_hot_wallet(&self) -> std::io::Result<(String, AddressbookEntry)> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "hot wallet generation is delegated to the root-agent IPC, not implemented in-process",
        ))
    }
}

impl Addressbook {
    /// Reads the persisted JSON at `path`. Entries with invalid internal
    /// addresses are dropped with a diagnostic, never silently "corrected".
    /// Returns an empty book if the file is absent. Never throws.
    pub async fn load(path: &Path) -> Self {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        let parsed: HashMap<String, RawEntry> = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, path = %path.display(), "addressbook JSON is malformed, starting empty");
                return Self::default();
            }
        };

        let mut entries = HashMap::with_capacity(parsed.len());
        for (role, raw_entry) in parsed {
            match InternalAddress::try_from(raw_entry.address.clone()) {
                Ok(address) => {
                    entries.insert(
                        role,
                        AddressbookEntry {
                            address,
                            keyfile: raw_entry.keyfile.map(PathBuf::from),
                        },
                    );
                }
                Err(_) => {
                    warn!(role, address = %raw_entry.address, "dropping addressbook entry with invalid internal address");
                }
            }
        }
        Self { entries }
    }

    /// Re-reads the book from disk, replacing the in-memory copy.
    pub async fn refresh(&mut self, path: &Path) {
        *self = Self::load(path).await;
    }

    pub fn get(&self, role: &str) -> Option<&AddressbookEntry> {
        self.entries.get(role)
    }

    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Inserts or replaces an entry in the in-memory copy. Callers must
    /// still [`Addressbook::save`] to persist it.
    pub fn upsert(&mut self, role: impl Into<String>, entry: AddressbookEntry) {
        self.entries.insert(role.into(), entry);
    }

    /// Hands this book off to the external writer. On failure, logs and
    /// returns — does not retry here.
    pub async fn save(&self, writer: &dyn AddressbookWriter) {
        if let Err(e) = writer.write(self).await {
            warn!(error = %e, "addressbook write failed");
        }
    }

    /// Resolves `id` to an internal address: if it looks like an address
    /// (internal or bech32m) it is normalized directly; otherwise it is
    /// treated as a role name.
    pub async fn resolve_address<R: PublicKeyIndex>(
        &self,
        id: &str,
        codec: &AddressCodec<R>,
    ) -> Result<InternalAddress, AddressbookError> {
        if is_internal(id) || looks_like_bech32m(id) {
            return codec
                .normalize(id)
                .await
                .map_err(|_| AddressbookError::Unresolvable(id.to_string()));
        }
        self.entries
            .get(id)
            .map(|e| e.address)
            .ok_or_else(|| AddressbookError::Unresolvable(id.to_string()))
    }

    /// Resolves `role` to a signable [`Wallet`].
    pub async fn resolve_wallet(&self, role: &str) -> Result<Wallet, AddressbookError> {
        let entry = self
            .entries
            .get(role)
            .ok_or_else(|| AddressbookError::NoRole(role.to_string()))?;
        let keyfile = entry
            .keyfile
            .as_ref()
            .ok_or_else(|| AddressbookError::NoKeyfile(role.to_string()))?;
        WalletResolver::resolve(keyfile)
            .await
            .map_err(|e| match e {
                WalletError::KeyfileMissing(_) => AddressbookError::KeyfileMissing(role.to_string()),
                other => {
                    warn!(role, error = %other, "wallet derivation failed");
                    AddressbookError::KeyfileMissing(role.to_string())
                }
            })
    }

    /// Ensures a "hot" role exists, generating one via the external agent
    /// and persisting it if absent.
    pub async fn ensure_hot_wallet(&mut self, writer: &dyn AddressbookWriter) {
        if self.entries.contains_key("hot") {
            return;
        }
        match writer.generate_hot_wallet().await {
            Ok((role, entry)) => {
                self.upsert(role, entry);
                self.save(writer).await;
            }
            Err(e) => warn!(error = %e, "failed to generate hot wallet"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    address: String,
    #[serde(default)]
    keyfile: Option<String>,
}

fn looks_like_bech32m(s: &str) -> bool {
    s.contains('1') && s.chars().all(|c| c.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NeverResolves;

    fn entry(addr: &str) -> AddressbookEntry {
        AddressbookEntry {
            address: addr.parse().unwrap(),
            keyfile: None,
        }
    }

    #[test]
    fn role_name_validation() {
        assert!(is_valid_role_name("hot_wallet_2"));
        assert!(!is_valid_role_name(""));
        assert!(!is_valid_role_name("has space"));
        assert!(!is_valid_role_name(&"a".repeat(33)));
    }

    #[tokio::test]
    async fn resolve_address_by_role() {
        let mut book = Addressbook::default();
        book.upsert(
            "admin",
            entry("0x1111111111111111111111111111111111111111111111111111111111111a"),
        );
        let codec = AddressCodec::new(NeverResolves);
        let resolved = book.resolve_address("admin", &codec).await.unwrap();
        assert_eq!(resolved, book.get("admin").unwrap().address);
    }

    #[tokio::test]
    async fn resolve_address_missing_role_fails() {
        let book = Addressbook::default();
        let codec = AddressCodec::new(NeverResolves);
        assert!(matches!(
            book.resolve_address("nope", &codec).await,
            Err(AddressbookError::Unresolvable(_))
        ));
    }

    #[tokio::test]
    async fn resolve_wallet_without_keyfile_is_read_only() {
        let mut book = Addressbook::default();
        book.upsert(
            "admin",
            entry("0x1111111111111111111111111111111111111111111111111111111111111a"),
        );
        assert!(matches!(
            book.resolve_wallet("admin").await,
            Err(AddressbookError::NoKeyfile(_))
        ));
    }

    #[tokio::test]
    async fn load_drops_invalid_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addressbook.json");
        tokio::fs::write(
            &path,
            r#"{"admin": {"address": "0xdeadbeef"}, "hot": {"address": "0x1111111111111111111111111111111111111111111111111111111111111a"}}"#,
        )
        .await
        .unwrap();
        let book = Addressbook::load(&path).await;
        assert!(book.get("admin").is_none());
        assert!(book.get("hot").is_some());
    }

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let book = Addressbook::load(Path::new("/nonexistent/addressbook.json")).await;
        assert_eq!(book.roles().count(), 0);
    }
}
