//! enclave_proto: Wire types and codecs for Darklock Enclave
//!
//! Everything a relay can observe is defined here, together with the binary
//! group metadata extension carried inside MLS group state.
//!
//! # Modules
//! - `event`    : signed events and unsigned rumors, id/signature rules
//! - `kind`     : event kind numbers
//! - `builder`  : constructors for every envelope shape, seal + gift wrap
//! - `filter`   : subscription filters with local matching
//! - `relay_msg`: relay wire protocol messages
//! - `extension`: group metadata extension (binary)
//! - `codec`    : big-endian reader/writer used by `extension`

pub mod builder;
pub mod codec;
pub mod error;
pub mod event;
pub mod extension;
pub mod filter;
pub mod kind;
pub mod relay_msg;

pub use error::{CodecError, ExtensionError, ProtoError};
pub use event::{Event, Tag, UnsignedEvent};
pub use extension::{GroupMetadata, ImageRef};
pub use filter::Filter;
pub use relay_msg::{ClientMessage, RelayMessage};
