//! Group metadata extension.
//!
//! Attached to the MLS group context under extension type `0xF2EE` so every
//! member holds an authenticated copy of the group's descriptive data.
//!
//! Layout (big-endian):
//!
//! ```text
//! u16   version (= 1)
//! [32]  transport group id
//! u16   len | name           (UTF-8)
//! u16   len | description    (UTF-8)
//! u16   len | admins         (len / 32 identities, concatenated)
//! u16   len | relays         (newline-joined UTF-8)
//! [32]  image hash
//! [32]  image key
//! [12]  image nonce
//! ```
//!
//! An all-zero image triple means "no image set".

use enclave_crypto::PublicKey;

use crate::codec::{Reader, Writer};
use crate::error::ExtensionError;

pub const EXTENSION_TYPE: u16 = 0xF2EE;
pub const METADATA_VERSION: u16 = 1;

const ADMIN_LEN: usize = 32;

/// Encrypted group image location. The blob itself lives outside the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageRef {
    pub hash: [u8; 32],
    pub key: [u8; 32],
    pub nonce: [u8; 12],
}

impl ImageRef {
    pub fn is_set(&self) -> bool {
        *self != Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMetadata {
    /// Routing id used on the transport (`h` tag). Unrelated to the MLS group id.
    pub transport_id: [u8; 32],
    pub name: String,
    pub description: String,
    pub admins: Vec<PublicKey>,
    pub relays: Vec<String>,
    pub image: ImageRef,
}

impl GroupMetadata {
    pub fn transport_id_hex(&self) -> String {
        hex::encode(self.transport_id)
    }

    pub fn is_admin(&self, key: &PublicKey) -> bool {
        self.admins.contains(key)
    }

    pub fn encode(&self) -> Result<Vec<u8>, ExtensionError> {
        for relay in &self.relays {
            if relay.is_empty() || relay.contains('\n') {
                return Err(ExtensionError::InvalidRelay(relay.clone()));
            }
        }

        let admins: Vec<u8> = self.admins.iter().flat_map(|a| a.0).collect();
        let relays = self.relays.join("\n");

        let mut w = Writer::new();
        w.put_u16(METADATA_VERSION);
        w.put_fixed(&self.transport_id);
        w.put_vec16("name", self.name.as_bytes())?;
        w.put_vec16("description", self.description.as_bytes())?;
        w.put_vec16("admins", &admins)?;
        w.put_vec16("relays", relays.as_bytes())?;
        w.put_fixed(&self.image.hash);
        w.put_fixed(&self.image.key);
        w.put_fixed(&self.image.nonce);
        Ok(w.finish())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ExtensionError> {
        let mut r = Reader::new(bytes);

        let version = r.read_u16()?;
        if version != METADATA_VERSION {
            return Err(ExtensionError::UnsupportedVersion(version));
        }
        let transport_id = r.read_fixed::<32>()?;
        let name = utf8(r.read_vec16()?, "name")?;
        let description = utf8(r.read_vec16()?, "description")?;

        let admin_block = r.read_vec16()?;
        if admin_block.len() % ADMIN_LEN != 0 {
            return Err(ExtensionError::AdminBlockLength(admin_block.len()));
        }
        let admins = admin_block
            .chunks_exact(ADMIN_LEN)
            .map(|c| {
                let mut key = [0u8; 32];
                key.copy_from_slice(c);
                PublicKey(key)
            })
            .collect();

        let relay_block = utf8(r.read_vec16()?, "relays")?;
        let relays = if relay_block.is_empty() {
            Vec::new()
        } else {
            relay_block.split('\n').map(str::to_owned).collect()
        };

        let image = ImageRef {
            hash: r.read_fixed::<32>()?,
            key: r.read_fixed::<32>()?,
            nonce: r.read_fixed::<12>()?,
        };
        r.finish()?;

        Ok(Self {
            transport_id,
            name,
            description,
            admins,
            relays,
            image,
        })
    }
}

fn utf8(bytes: &[u8], field: &'static str) -> Result<String, ExtensionError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| ExtensionError::InvalidUtf8(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CodecError;

    fn sample() -> GroupMetadata {
        GroupMetadata {
            transport_id: [0xAB; 32],
            name: "Test Group".into(),
            description: "a place".into(),
            admins: vec![PublicKey([1; 32]), PublicKey([2; 32])],
            relays: vec!["wss://relay.one".into(), "wss://relay.two".into()],
            image: ImageRef {
                hash: [3; 32],
                key: [4; 32],
                nonce: [5; 12],
            },
        }
    }

    #[test]
    fn roundtrip_full() {
        let m = sample();
        assert_eq!(GroupMetadata::decode(&m.encode().unwrap()).unwrap(), m);
    }

    #[test]
    fn roundtrip_empty_fields() {
        let m = GroupMetadata {
            transport_id: [0; 32],
            name: String::new(),
            description: String::new(),
            admins: vec![],
            relays: vec![],
            image: ImageRef::default(),
        };
        let bytes = m.encode().unwrap();
        // version + id + four empty vectors + image triple
        assert_eq!(bytes.len(), 2 + 32 + 4 * 2 + 32 + 32 + 12);
        let back = GroupMetadata::decode(&bytes).unwrap();
        assert_eq!(back, m);
        assert!(!back.image.is_set());
    }

    #[test]
    fn roundtrip_unicode_name() {
        let mut m = sample();
        m.name = "Grüppe 🔒".into();
        assert_eq!(GroupMetadata::decode(&m.encode().unwrap()).unwrap(), m);
    }

    #[test]
    fn every_truncation_is_rejected() {
        let bytes = sample().encode().unwrap();
        for cut in 0..bytes.len() {
            let err = GroupMetadata::decode(&bytes[..cut]).unwrap_err();
            assert!(
                matches!(err, ExtensionError::Codec(CodecError::Truncated { .. })),
                "cut at {cut}: {err:?}"
            );
        }
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert!(matches!(
            GroupMetadata::decode(&bytes),
            Err(ExtensionError::Codec(CodecError::TrailingBytes(1)))
        ));
    }

    #[test]
    fn admin_block_must_be_whole_keys() {
        let mut w = Writer::new();
        w.put_u16(METADATA_VERSION);
        w.put_fixed(&[0; 32]);
        w.put_vec16("name", b"").unwrap();
        w.put_vec16("description", b"").unwrap();
        w.put_vec16("admins", &[7; 33]).unwrap();
        w.put_vec16("relays", b"").unwrap();
        w.put_fixed(&[0; 76]);
        assert!(matches!(
            GroupMetadata::decode(&w.finish()),
            Err(ExtensionError::AdminBlockLength(33))
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = sample().encode().unwrap();
        bytes[1] = 9;
        assert!(matches!(
            GroupMetadata::decode(&bytes),
            Err(ExtensionError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn relay_with_newline_rejected() {
        let mut m = sample();
        m.relays = vec!["wss://a\nwss://b".into()];
        assert!(matches!(m.encode(), Err(ExtensionError::InvalidRelay(_))));
    }

    #[test]
    fn oversized_description_rejected() {
        let mut m = sample();
        m.description = "x".repeat(70_000);
        assert!(matches!(m.encode(), Err(ExtensionError::Codec(_))));
    }
}
