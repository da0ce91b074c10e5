//! Address Codec: bech32m human-format addresses <-> 32-byte internal identity.
//!
//! On-chain identities are 32 bytes, rendered as lowercase `0x` + 64 hex
//! characters ([`InternalAddress`]). Off-chain, users and config files carry
//! bech32m strings in one of two semantic classes:
//!
//! - *Native taproot-style*: the witness program **is** the on-chain identity.
//! - *Post-quantum*: the witness program is a hash of a post-quantum public
//!   key, not the identity itself. Resolving it requires an RPC round trip
//!   to the chain's public-key index ([`PublicKeyIndex`]).
//!
//! The post-quantum resolver is an injected strategy (see [`PublicKeyIndex`])
//! so tests can mock the RPC round trip; production wires it to [`crate::rpc`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bech32::segwit;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// bech32m human-readable prefixes whose witness program is the on-chain identity.
pub const NATIVE_TAPROOT_HRPS: &[&str] = &["bx", "tbx"];

/// bech32m human-readable prefixes whose witness program must be resolved via RPC.
pub const POST_QUANTUM_HRPS: &[&str] = &["bxpq", "tbxpq"];

static INTERNAL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?i)0x[0-9a-f]{64}$").expect("valid regex"));

/// Errors produced while normalizing or resolving an address.
///
/// Never panics the caller; every failure mode is a recoverable [`Result`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The input is neither a `0x`-hex internal address nor a decodable bech32m string.
    #[error("not an address: {0}")]
    NotAnAddress(String),
    /// A post-quantum address could not be resolved: the RPC echoed the input program
    /// unchanged, meaning it has not yet been observed on-chain.
    #[error("unresolvable post-quantum address: {0}")]
    Unresolvable(String),
}

/// A 32-byte on-chain identity.
///
/// Exactly one canonical form per identity: lowercase `0x` + 64 hex characters.
/// Equality is byte-equality. The all-zero value is the "unset" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct InternalAddress([u8; 32]);

impl InternalAddress {
    /// The all-zero "unset" sentinel.
    pub const fn zero() -> Self {
        InternalAddress([0u8; 32])
    }

    /// Build directly from 32 raw bytes (already the canonical internal form).
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        InternalAddress(bytes)
    }

    /// The raw 32 bytes of this identity.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True iff this is the all-zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for InternalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex_lower(&self.0))
    }
}

impl fmt::Debug for InternalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InternalAddress({self})")
    }
}

impl FromStr for InternalAddress {
    type Err = AddressError;

    /// Parses a canonical `0x`+64-hex string. Does not attempt bech32m decoding;
    /// use [`AddressCodec::normalize`] for the full normalization pipeline.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !is_internal(s) {
            return Err(AddressError::NotAnAddress(s.to_string()));
        }
        let mut bytes = [0u8; 32];
        hex_decode(&s[2..], &mut bytes).map_err(|_| AddressError::NotAnAddress(s.to_string()))?;
        Ok(InternalAddress(bytes))
    }
}

impl TryFrom<String> for InternalAddress {
    type Error = AddressError;
    fn try_from(value: String) -> Result<Self, Self::Error> {
        InternalAddress::from_str(&value)
    }
}

impl From<InternalAddress> for String {
    fn from(value: InternalAddress) -> Self {
        value.to_string()
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn hex_decode(s: &str, out: &mut [u8; 32]) -> Result<(), ()> {
    if s.len() != 64 {
        return Err(());
    }
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let byte_str = std::str::from_utf8(chunk).map_err(|_| ())?;
        out[i] = u8::from_str_radix(byte_str, 16).map_err(|_| ())?;
    }
    Ok(())
}

/// Exact match on `^0x[0-9a-f]{64}$`, case-insensitive on accept.
pub fn is_internal(s: &str) -> bool {
    INTERNAL_RE.is_match(s)
}

/// Resolves a post-quantum witness program to its 32-byte on-chain identity
/// via the chain's public-key index.
///
/// If the RPC echoes the input program unchanged, the address is considered
/// not yet observed on-chain and resolution must fail with
/// [`AddressError::Unresolvable`] (enforced by [`AddressCodec::normalize`],
/// not by implementors).
#[async_trait]
pub trait PublicKeyIndex: Send + Sync {
    /// Returns the witness program unchanged when the chain holds no record
    /// of the corresponding public key yet.
    async fn lookup_identity(&self, program: &[u8; 32]) -> Result<[u8; 32], AddressError>;
}

/// A resolver that never resolves; useful where only native-taproot and
/// internal addresses are expected.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverResolves;

#[async_trait]
impl PublicKeyIndex for NeverResolves {
    async fn lookup_identity(&self, program: &[u8; 32]) -> Result<[u8; 32], AddressError> {
        Ok(*program)
    }
}

/// The Address Codec: validates, normalizes, and compares on-chain identities.
///
/// Generic over the injected [`PublicKeyIndex`] strategy used to resolve
/// post-quantum addresses, so tests can supply a mock RPC.
#[derive(Debug, Clone)]
pub struct AddressCodec<R> {
    resolver: R,
}

impl<R: PublicKeyIndex> AddressCodec<R> {
    /// Builds a codec backed by the given post-quantum resolver strategy.
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// The all-zero "unset" constant.
    pub fn zero(&self) -> InternalAddress {
        InternalAddress::zero()
    }

    /// Normalizes any accepted address representation to its canonical
    /// internal form.
    ///
    /// 1. Already internal -> canonical-cased copy.
    /// 2. bech32m with a native-taproot prefix and a 32-byte, `version >= 1`
    ///    program -> the program, verbatim.
    /// 3. bech32m with a post-quantum prefix -> forwarded to the injected
    ///    [`PublicKeyIndex`]; an unchanged echo fails as [`AddressError::Unresolvable`].
    /// 4. Anything else fails as [`AddressError::NotAnAddress`].
    pub async fn normalize(&self, s: &str) -> Result<InternalAddress, AddressError> {
        if is_internal(s) {
            return InternalAddress::from_str(s);
        }

        let decoded = decode_bech32m(s).ok_or_else(|| AddressError::NotAnAddress(s.to_string()))?;

        if NATIVE_TAPROOT_HRPS.contains(&decoded.hrp.as_str()) {
            if decoded.witness_version >= 1 && decoded.program.len() == 32 {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&decoded.program);
                return Ok(InternalAddress(bytes));
            }
            return Err(AddressError::NotAnAddress(s.to_string()));
        }

        if POST_QUANTUM_HRPS.contains(&decoded.hrp.as_str()) {
            if decoded.program.len() != 32 {
                return Err(AddressError::NotAnAddress(s.to_string()));
            }
            let mut program = [0u8; 32];
            program.copy_from_slice(&decoded.program);
            let resolved = self.resolver.lookup_identity(&program).await?;
            if resolved == program {
                return Err(AddressError::Unresolvable(s.to_string()));
            }
            return Ok(InternalAddress(resolved));
        }

        Err(AddressError::NotAnAddress(s.to_string()))
    }

    /// Byte-equality after normalizing both inputs.
    pub async fn equal(&self, a: &str, b: &str) -> Result<bool, AddressError> {
        Ok(self.normalize(a).await? == self.normalize(b).await?)
    }
}

struct DecodedBech32m {
    hrp: String,
    witness_version: u8,
    program: Vec<u8>,
}

/// Decodes a segwit-style address string into `(hrp, witness_version, program)`.
///
/// Uses the `segwit` encoding from BIP-350: version 0 is checksummed as
/// bech32, version 1+ as bech32m. Returns `None` on any decode failure
/// rather than propagating a library error, since an undecodable string is
/// simply "not an address" to the caller.
fn decode_bech32m(s: &str) -> Option<DecodedBech32m> {
    let (hrp, version, program) = segwit::decode(s).ok()?;
    Some(DecodedBech32m {
        hrp: hrp.to_string(),
        witness_version: version.to_u8(),
        program,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_address_accepts_case_insensitive_and_canonicalizes() {
        let upper = "0xABCDEF0000000000000000000000000000000000000000000000000000000A";
        // length check: 0x + 64 chars
        assert_eq!(upper.len(), 66);
        assert!(is_internal(upper));
        let parsed = InternalAddress::from_str(upper).unwrap();
        assert_eq!(
            parsed.to_string(),
            "0xabcdef0000000000000000000000000000000000000000000000000000000a"
        );
    }

    #[test]
    fn zero_is_all_zero_bytes() {
        assert!(InternalAddress::zero().is_zero());
        assert_eq!(InternalAddress::zero().as_bytes(), &[0u8; 32]);
    }

    #[tokio::test]
    async fn normalize_is_idempotent_for_internal_addresses() {
        let codec = AddressCodec::new(NeverResolves);
        let s = "0x1111111111111111111111111111111111111111111111111111111111111a";
        let once = codec.normalize(s).await.unwrap();
        let twice = codec.normalize(&once.to_string()).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn normalize_rejects_garbage() {
        let codec = AddressCodec::new(NeverResolves);
        assert!(matches!(
            codec.normalize("not-an-address").await,
            Err(AddressError::NotAnAddress(_))
        ));
    }

    struct EchoResolver;
    #[async_trait]
    impl PublicKeyIndex for EchoResolver {
        async fn lookup_identity(&self, program: &[u8; 32]) -> Result<[u8; 32], AddressError> {
            Ok(*program)
        }
    }

    #[tokio::test]
    async fn pq_address_that_echoes_fails_unresolvable() {
        let hrp = bech32::Hrp::parse("bxpq").unwrap();
        let version = bech32::Fe32::try_from(1u8).unwrap();
        let program = [7u8; 32];
        let encoded = bech32::segwit::encode(hrp, version, &program).unwrap();
        let codec = AddressCodec::new(EchoResolver);
        assert!(matches!(
            codec.normalize(&encoded).await,
            Err(AddressError::Unresolvable(_))
        ));
    }
}
