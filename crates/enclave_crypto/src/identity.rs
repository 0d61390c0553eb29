//! Identity key management
//!
//! Each installation has one long-term `Identity` (Ed25519). Its 32 raw
//! public-key bytes are the group credential and the transport author key.
//! Disposable keys (per group message, per gift wrap) are the same type,
//! generated fresh and dropped after a single signature.
//!
//! Human-readable encodings are bech32 with the `enpub` / `ensec` prefixes.
//!
//! Key agreement uses the X25519 view of the Ed25519 keypair:
//!   - secret: clamped SHA-512 expansion of the seed (what ed25519-dalek uses)
//!   - public: birational map Edwards → Montgomery

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use bech32::{Bech32, Hrp};
use curve25519_dalek::edwards::CompressedEdwardsY;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::CryptoError;
use crate::hash;

pub const PUBLIC_HRP: Hrp = Hrp::parse_unchecked("enpub");
pub const SECRET_HRP: Hrp = Hrp::parse_unchecked("ensec");

/// Length of the truncated identity shown in audit entries.
pub const SHORT_HEX_LEN: usize = 16;

// ── Public key ────────────────────────────────────────────────────────────────

/// 32-byte Ed25519 public key. Serialized as lowercase hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let arr: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("public key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let mut arr = [0u8; 32];
        hex::decode_to_slice(s.trim(), &mut arr)?;
        Ok(Self(arr))
    }

    /// Accepts either lowercase hex or an `enpub1…` string.
    pub fn parse(s: &str) -> Result<Self, CryptoError> {
        let s = s.trim();
        if s.starts_with("enpub1") {
            Self::from_bech32(s)
        } else {
            Self::from_hex(s)
        }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 16 hex characters. Enough to correlate log lines, not enough to
    /// identify the key outside this installation.
    pub fn short(&self) -> String {
        let mut s = self.to_hex();
        s.truncate(SHORT_HEX_LEN);
        s
    }

    pub fn to_bech32(&self) -> Result<String, CryptoError> {
        bech32::encode::<Bech32>(PUBLIC_HRP, &self.0)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    pub fn from_bech32(s: &str) -> Result<Self, CryptoError> {
        let (hrp, data) =
            bech32::decode(s).map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        if hrp != PUBLIC_HRP {
            return Err(CryptoError::KeyEncoding(format!(
                "expected prefix {PUBLIC_HRP}, got {hrp}"
            )));
        }
        Self::from_slice(&data)
    }

    pub fn fingerprint(&self) -> String {
        hash::fingerprint(&self.0)
    }

    /// Verify an Ed25519 signature made by this key.
    pub fn verify(&self, msg: &[u8], sig_bytes: &[u8]) -> Result<(), CryptoError> {
        let vk = VerifyingKey::from_bytes(&self.0)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let sig = Signature::from_bytes(
            sig_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("bad signature length".into()))?,
        );
        vk.verify(msg, &sig)
            .map_err(|_| CryptoError::SignatureVerification)
    }

    /// X25519 public key for DH with this identity.
    pub fn to_x25519(&self) -> Result<X25519Public, CryptoError> {
        let compressed = CompressedEdwardsY::from_slice(&self.0)
            .map_err(|_| CryptoError::InvalidKey("invalid Ed25519 public key".into()))?;
        let point = compressed.decompress().ok_or_else(|| {
            CryptoError::InvalidKey("Ed25519 public key decompression failed".into())
        })?;
        Ok(X25519Public::from(point.to_montgomery().to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.short())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        PublicKey::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

// ── Identity keypair ──────────────────────────────────────────────────────────

/// Ed25519 signing keypair. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct Identity {
    #[zeroize(skip)]
    public: PublicKey,
    secret: [u8; 32],
}

impl Identity {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicKey(signing_key.verifying_key().to_bytes()),
            secret: signing_key.to_bytes(),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidKey(format!("identity key must be 32 bytes, got {}", bytes.len()))
        })?;
        let signing_key = SigningKey::from_bytes(&secret);
        Ok(Self {
            public: PublicKey(signing_key.verifying_key().to_bytes()),
            secret,
        })
    }

    pub fn from_bech32(s: &str) -> Result<Self, CryptoError> {
        let (hrp, data) =
            bech32::decode(s.trim()).map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;
        let data = Zeroizing::new(data);
        if hrp != SECRET_HRP {
            return Err(CryptoError::KeyEncoding(format!(
                "expected prefix {SECRET_HRP}, got {hrp}"
            )));
        }
        Self::from_secret_bytes(&data)
    }

    /// Load the identity stored at `path`, or create and persist a new one.
    /// Returns the identity and whether it was freshly generated.
    ///
    /// The file holds the hex seed and is written owner-only (0600).
    pub fn load_or_generate(path: &Path) -> Result<(Self, bool), CryptoError> {
        if path.exists() {
            return Ok((Self::load(path)?, false));
        }
        let identity = Self::generate();
        identity.save(path)?;
        Ok((identity, true))
    }

    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let contents = Zeroizing::new(fs::read_to_string(path)?);
        let mut seed = Zeroizing::new([0u8; 32]);
        hex::decode_to_slice(contents.trim(), seed.as_mut())?;
        Self::from_secret_bytes(seed.as_ref())
    }

    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("key.tmp");
        {
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut file = opts.open(&tmp)?;
            let mut encoded = hex::encode(self.secret);
            file.write_all(encoded.as_bytes())?;
            encoded.zeroize();
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    pub fn to_bech32_secret(&self) -> Result<Zeroizing<String>, CryptoError> {
        bech32::encode::<Bech32>(SECRET_HRP, &self.secret)
            .map(Zeroizing::new)
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        SigningKey::from_bytes(&self.secret).sign(msg).to_bytes()
    }

    /// X25519 static secret derived from the Ed25519 seed.
    pub fn x25519_secret(&self) -> StaticSecret {
        let mut h = Sha512::digest(self.secret);
        // Clamp as per RFC 7748 §5
        h[0] &= 248;
        h[31] &= 127;
        h[31] |= 64;
        let mut key = [0u8; 32];
        key.copy_from_slice(&h[..32]);
        h.as_mut_slice().zeroize();
        let secret = StaticSecret::from(key);
        key.zeroize();
        secret
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}
