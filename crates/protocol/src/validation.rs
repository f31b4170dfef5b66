use std::sync::LazyLock;

use regex::Regex;
use watchroom_common::Error;

static ROOM_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{0,24}$").expect("static regex"));
static USERNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]{4,16}$").expect("static regex"));
static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+@\S+\.\S+$").expect("static regex"));

pub const RESERVED_USERNAME: &str = "system";

/// `local_file` / `remote_file` — the only two room types the client may set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomType {
    LocalFile,
    RemoteFile,
}

impl RoomType {
    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "local_file" => Ok(RoomType::LocalFile),
            "remote_file" => Ok(RoomType::RemoteFile),
            _ => Err(Error::BadInput("Invalid room type.".to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomType::LocalFile => "local_file",
            RoomType::RemoteFile => "remote_file",
        }
    }
}

/// Validates a client-supplied room id, or `Ok(None)` for "generate one".
pub fn validate_room_id(id: &str) -> Result<Option<&str>, Error> {
    if id.is_empty() {
        return Ok(None);
    }
    if !ROOM_ID_RE.is_match(id) {
        return Err(Error::BadInput("Invalid room id.".to_string()));
    }
    Ok(Some(id))
}

/// `type`/`target` travel together: an empty type means both are empty.
pub fn validate_room_type_target(room_type: &str, target: &str) -> Result<(), Error> {
    if room_type.is_empty() {
        return Ok(());
    }
    RoomType::parse(room_type)?;
    if target.is_empty() {
        return Err(Error::BadInput("Target must not be empty.".to_string()));
    }
    if target.chars().count() > 1024 {
        return Err(Error::BadInput("Target is too long.".to_string()));
    }
    Ok(())
}

pub fn validate_username(username: &str) -> Result<(), Error> {
    if username == RESERVED_USERNAME {
        return Err(Error::BadInput(
            "This username is reserved.".to_string(),
        ));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(Error::BadInput("Invalid username.".to_string()));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<(), Error> {
    if !EMAIL_RE.is_match(email) {
        return Err(Error::BadInput("Invalid email address.".to_string()));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), Error> {
    let len = password.chars().count();
    if !(8..=64).contains(&len) {
        return Err(Error::BadInput(
            "Password must be 8 to 64 characters.".to_string(),
        ));
    }
    Ok(())
}

/// Trims and length-checks a chat payload. `Ok(None)` means "silently drop, no error frame" —
/// the protocol discards empty/oversized chat rather than surfacing an error.
pub fn validate_chat_message(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let len = trimmed.chars().count();
    if len == 0 || len > 2000 {
        return None;
    }
    Some(trimmed.to_string())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_accepts_empty_and_valid() {
        assert_eq!(validate_room_id("").unwrap(), None);
        assert_eq!(validate_room_id("abc-123_XYZ").unwrap(), Some("abc-123_XYZ"));
    }

    #[test]
    fn room_id_rejects_bad_chars_and_length() {
        assert!(validate_room_id("has space").is_err());
        assert!(validate_room_id(&"a".repeat(25)).is_err());
    }

    #[test]
    fn username_rejects_reserved_and_bad_shape() {
        assert!(validate_username("system").is_err());
        assert!(validate_username("ab").is_err());
        assert!(validate_username("Upper").is_err());
        assert!(validate_username("valid_name1").is_ok());
    }

    #[test]
    fn chat_message_boundaries() {
        assert_eq!(validate_chat_message(""), None);
        assert_eq!(validate_chat_message("   "), None);
        assert_eq!(validate_chat_message(&"a".repeat(2001)), None);
        assert!(validate_chat_message("a").is_some());
        assert!(validate_chat_message(&"a".repeat(2000)).is_some());
    }

    #[test]
    fn room_type_target_pairing() {
        assert!(validate_room_type_target("", "").is_ok());
        assert!(validate_room_type_target("local_file", "").is_err());
        assert!(validate_room_type_target("bogus", "x").is_err());
        assert!(validate_room_type_target("remote_file", "https://x/y").is_ok());
    }
}
