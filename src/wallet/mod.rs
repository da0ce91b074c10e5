//! Keyfile-backed wallet derivation.
//!
//! A [`Wallet`] is an ephemeral value type: derived from a keyfile
//! containing a mnemonic, carried by reference through a single pipeline
//! step, and never cached across scheduler ticks. It pairs a classical
//! (secp256k1, taproot-style) keypair with a post-quantum (ML-DSA) keypair;
//! the two are never split apart. Derivation is pure — the same keyfile
//! input always yields the same wallet — and all derived secret material is
//! zeroized on drop.

use std::path::{Path, PathBuf};

use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use ml_dsa::{KeyGen, MlDsa65, SigningKey, VerifyingKey};
use rand_chacha::ChaCha20Rng;
use rand_chacha::rand_core::SeedableRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::address::InternalAddress;

/// bech32m human-readable prefix used for wallet-derived native-taproot
/// addresses. See [`crate::address::NATIVE_TAPROOT_HRPS`].
const WALLET_HRP: &str = "bx";

/// Errors deriving a wallet from a keyfile.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("keyfile not found or unreadable: {0}")]
    KeyfileMissing(PathBuf),
    #[error("invalid mnemonic in keyfile: {0}")]
    InvalidMnemonic(String),
    #[error("key derivation failed: {0}")]
    Derivation(String),
}

/// A keyfile-derived signing identity: a classical keypair paired with a
/// post-quantum keypair, plus the external/internal address they resolve to.
///
/// Owns zeroization of all derived secret material on drop; destroying the
/// in-memory wallet promptly after use is the caller's responsibility.
pub struct Wallet {
    classical_secret: Zeroizing<[u8; 32]>,
    classical_public: PublicKey,
    classical_signer_id: String,
    pq_signing: SigningKey<MlDsa65>,
    #[allow(dead_code)] // kept alongside the signing key; verification is the chain's job
    pq_verifying: VerifyingKey<MlDsa65>,
    mldsa_signer_id: String,
    external_address: String,
    internal_address: InternalAddress,
}

impl Wallet {
    /// The wallet's 32-byte on-chain identity (the taproot output key).
    pub fn internal_address(&self) -> InternalAddress {
        self.internal_address
    }

    /// The wallet's bech32m external address.
    pub fn external_address(&self) -> &str {
        &self.external_address
    }

    /// Opaque signer identity for the classical key, passed to
    /// [`crate::rpc::SendSigned::signer`].
    pub fn classical_signer_id(&self) -> &str {
        &self.classical_signer_id
    }

    /// Opaque signer identity for the post-quantum key, passed to
    /// [`crate::rpc::SendSigned::mldsa_signer`].
    pub fn mldsa_signer_id(&self) -> &str {
        &self.mldsa_signer_id
    }

    /// The classical secp256k1 secret key, reconstructed on demand from the
    /// zeroized byte buffer this wallet owns.
    pub fn classical_secret_key(&self) -> SecretKey {
        SecretKey::from_slice(&*self.classical_secret).expect("derived secret key is always valid")
    }

    /// The post-quantum signing key.
    pub fn mldsa_signing_key(&self) -> &SigningKey<MlDsa65> {
        &self.pq_signing
    }
}

/// Reads a keyfile (a BIP-39 mnemonic, one phrase per file) and derives its
/// wallet pair. Pure: the same keyfile always yields the same wallet. Does
/// not cache derived secrets.
pub struct WalletResolver;

impl WalletResolver {
    /// Reads `path` and derives the wallet it encodes.
    pub async fn resolve(path: &Path) -> Result<Wallet, WalletError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|_| WalletError::KeyfileMissing(path.to_path_buf()))?;
        derive_wallet(contents.trim())
    }
}

/// Derives a [`Wallet`] from a mnemonic phrase. Exposed directly so callers
/// that already hold the phrase (e.g. the hot-wallet generation flow) don't
/// need to round-trip through a file.
pub fn derive_wallet(mnemonic_phrase: &str) -> Result<Wallet, WalletError> {
    let mnemonic = bip39::Mnemonic::parse_normalized(mnemonic_phrase)
        .map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
    let seed = mnemonic.to_seed("");

    let classical_secret = derive_classical_secret(&seed)?;
    let secp = Secp256k1::new();
    let secret_key =
        SecretKey::from_slice(&*classical_secret).map_err(|e| WalletError::Derivation(e.to_string()))?;
    let public_key = PublicKey::from_secret_key(&secp, &secret_key);
    let (x_only, _parity) = public_key.x_only_public_key();
    let internal_bytes = x_only.serialize();

    let pq_seed = kdf(&seed, b"blockhost/mldsa/v1");
    let mut rng = ChaCha20Rng::from_seed(pq_seed);
    let pq_keypair = MlDsa65::key_gen(&mut rng);

    let internal_address = InternalAddress::from_bytes(internal_bytes);
    let hrp = bech32::Hrp::parse(WALLET_HRP).expect("valid static hrp");
    let version = bech32::Fe32::try_from(1u8).expect("1 is a valid field element");
    let external_address = bech32::segwit::encode(hrp, version, &internal_bytes)
        .map_err(|e| WalletError::Derivation(e.to_string()))?;

    let classical_signer_id = hex::encode(public_key.serialize());
    let mldsa_signer_id = hex::encode(pq_keypair.verifying_key().encode());

    Ok(Wallet {
        classical_secret,
        classical_public: public_key,
        classical_signer_id,
        pq_signing: pq_keypair.signing_key().clone(),
        pq_verifying: pq_keypair.verifying_key().clone(),
        mldsa_signer_id,
        external_address,
        internal_address,
    })
}

/// Reduces the first 32 bytes of `seed` into a valid non-zero secp256k1
/// scalar by rejection sampling against successive HMAC-style re-hashes.
fn derive_classical_secret(seed: &[u8]) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let mut candidate = kdf(seed, b"blockhost/secp256k1/v1");
    for _ in 0..8 {
        if SecretKey::from_slice(&candidate).is_ok() {
            return Ok(Zeroizing::new(candidate));
        }
        candidate = kdf(&candidate, b"blockhost/secp256k1/retry");
    }
    Err(WalletError::Derivation(
        "failed to derive a valid secp256k1 scalar".to_string(),
    ))
}

fn kdf(input: &[u8], domain: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(domain);
    hasher.update(input);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn derivation_is_pure() {
        let a = derive_wallet(TEST_MNEMONIC).unwrap();
        let b = derive_wallet(TEST_MNEMONIC).unwrap();
        assert_eq!(a.internal_address(), b.internal_address());
        assert_eq!(a.external_address(), b.external_address());
        assert_eq!(a.classical_signer_id(), b.classical_signer_id());
        assert_eq!(a.mldsa_signer_id(), b.mldsa_signer_id());
    }

    #[test]
    fn external_address_round_trips_to_internal() {
        let wallet = derive_wallet(TEST_MNEMONIC).unwrap();
        let (hrp, version, program) = bech32::segwit::decode(wallet.external_address()).unwrap();
        assert_eq!(hrp.to_string(), WALLET_HRP);
        assert_eq!(version.to_u8(), 1);
        assert_eq!(program.as_slice(), wallet.internal_address().as_bytes());
    }
}
