//! Naming rules for nicknames, user names, and channels.
//!
//! The canonical form of a nickname or channel name is its lower-cased
//! spelling; that is what the server indexes and compares. Validators are
//! stricter than the RFC grammar: plain ASCII, `#` channels only.

/// RFC 1459 nickname limit. User names share it.
pub const MAX_NICK_LENGTH: usize = 9;

/// RFC 1459 channel name limit.
pub const MAX_CHANNEL_LENGTH: usize = 50;

/// The canonical (lower-cased) form used for uniqueness and lookup.
pub fn canonicalize(name: &str) -> String {
    name.to_lowercase()
}

/// A nickname is 1..=9 of `a-z`, `0-9`, or `_`, not starting with a digit.
pub fn is_valid_nick(nick: &str) -> bool {
    if nick.is_empty() || nick.len() > MAX_NICK_LENGTH {
        return false;
    }
    nick.bytes().enumerate().all(|(i, b)| match b {
        b'a'..=b'z' | b'_' => true,
        b'0'..=b'9' => i > 0,
        _ => false,
    })
}

/// A user name is 1..=9 of `a-z` or `0-9`.
pub fn is_valid_user(user: &str) -> bool {
    !user.is_empty()
        && user.len() <= MAX_NICK_LENGTH
        && user
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// A channel name is `#` followed by up to 49 of `a-z` or `0-9`. A bare
/// `#` is allowed. Canonicalize before calling.
pub fn is_valid_channel(channel: &str) -> bool {
    if channel.is_empty() || channel.len() > MAX_CHANNEL_LENGTH {
        return false;
    }
    let mut bytes = channel.bytes();
    bytes.next() == Some(b'#') && bytes.all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_lowercase() {
        assert_eq!(canonicalize("Moss"), "moss");
        assert_eq!(canonicalize("#Tarn"), "#tarn");
        assert_eq!(canonicalize("already"), "already");
    }

    #[test]
    fn nick_accepts_letters_digits_underscore() {
        assert!(is_valid_nick("moss"));
        assert!(is_valid_nick("moss_2"));
        assert!(is_valid_nick("m"));
        assert!(is_valid_nick("_leading"));
    }

    #[test]
    fn nick_rejects_bad_shapes() {
        assert!(!is_valid_nick(""));
        assert!(!is_valid_nick("toolongnick"));
        assert!(!is_valid_nick("9digit"));
        assert!(!is_valid_nick("UPPER"));
        assert!(!is_valid_nick("sp ace"));
        assert!(!is_valid_nick("da-sh"));
    }

    #[test]
    fn nick_boundary_lengths() {
        assert!(is_valid_nick("ninechars"));
        assert!(!is_valid_nick("tencharsxx"));
    }

    #[test]
    fn user_accepts_letters_and_digits_only() {
        assert!(is_valid_user("moss"));
        assert!(is_valid_user("moss2"));
        assert!(!is_valid_user(""));
        assert!(!is_valid_user("under_"));
        assert!(!is_valid_user("Upper"));
        assert!(!is_valid_user("toolonguser"));
    }

    #[test]
    fn channel_requires_hash_prefix() {
        assert!(is_valid_channel("#tarn"));
        assert!(is_valid_channel("#tarn2"));
        assert!(is_valid_channel("#"));
        assert!(!is_valid_channel("tarn"));
        assert!(!is_valid_channel(""));
        assert!(!is_valid_channel("&tarn"));
    }

    #[test]
    fn channel_rejects_bad_characters() {
        assert!(!is_valid_channel("#Tarn"));
        assert!(!is_valid_channel("#two words"));
        assert!(!is_valid_channel("#comma,comma"));
    }

    #[test]
    fn channel_boundary_length() {
        let longest = format!("#{}", "a".repeat(MAX_CHANNEL_LENGTH - 1));
        assert!(is_valid_channel(&longest));
        let too_long = format!("#{}", "a".repeat(MAX_CHANNEL_LENGTH));
        assert!(!is_valid_channel(&too_long));
    }
}
