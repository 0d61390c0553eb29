//! Transport event kinds.

/// Unsigned chat payload carried inside a group message.
pub const CHAT: u16 = 9;
/// Sender-authenticated seal around a rumor.
pub const SEAL: u16 = 13;
/// Published MLS key package.
pub const KEY_PACKAGE: u16 = 443;
/// MLS welcome rumor. Only ever travels inside a gift wrap.
pub const WELCOME: u16 = 444;
/// MLS group message routed by transport group id.
pub const GROUP_MESSAGE: u16 = 445;
/// Anonymizing outer envelope signed by a single-use key.
pub const GIFT_WRAP: u16 = 1059;

pub fn name(kind: u16) -> &'static str {
    match kind {
        CHAT => "chat",
        SEAL => "seal",
        KEY_PACKAGE => "key_package",
        WELCOME => "welcome",
        GROUP_MESSAGE => "group_message",
        GIFT_WRAP => "gift_wrap",
        _ => "unknown",
    }
}
