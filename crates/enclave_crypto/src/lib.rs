//! enclave_crypto: Darklock Enclave cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize all secret material on drop.
//! - Group key agreement itself lives in `enclave-core` (MLS); this crate
//!   only provides what is layered around it.
//!
//! # Module layout
//! - `identity`    : long-term Ed25519 identity, bech32 encodings, X25519 views
//! - `conversation`: conversation keys (group + recipient mode) and payload format
//! - `aead`        : XChaCha20-Poly1305 with size-class padding
//! - `kdf`         : HKDF-SHA256
//! - `hash`        : SHA-256 / BLAKE3 helpers
//! - `error`       : unified error type

pub mod aead;
pub mod conversation;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;

pub use conversation::ConversationKey;
pub use error::CryptoError;
pub use identity::{Identity, PublicKey};

/// Re-exported so callers can name X25519 types without a direct dependency.
pub use x25519_dalek;
