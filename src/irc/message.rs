//! IRC wire messages.
//!
//! One message per line: `[:prefix] COMMAND params... [:trailing]`,
//! terminated by CR LF on the wire. Parsing and serialization here operate
//! on a single line without the terminator; framing lives in the codec.

use std::fmt;

/// Maximum length of one wire line, including the trailing CR LF
/// (RFC 1459 section 2.3). The dispatcher consults this when truncating
/// over-long PRIVMSG payloads.
pub const MAX_LINE_LENGTH: usize = 512;

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Source prefix (server name or `nick!~user@ip`). Clients must not
    /// send one; the server attaches it to everything it originates.
    pub prefix: Option<String>,
    /// Command name or three-digit numeric.
    pub command: String,
    /// Parameters. Only the last one may contain spaces (trailing form).
    pub params: Vec<String>,
    /// Whether the final parameter is a trailing parameter. Set from the
    /// `:` sentinel when parsing; forces the sentinel when serializing, so
    /// free-text and list fields keep their trailing form even when they
    /// happen to hold no space.
    pub trailing: bool,
}

/// Errors from parsing a single line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("empty message")]
    Empty,
    #[error("prefix without a command")]
    MissingCommand,
}

impl Message {
    /// Parse one message from a line (with or without the trailing CR LF).
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches("\r\n");
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        // A leading `:` marks a prefix running up to the first space.
        let (prefix, mut rest) = match line.strip_prefix(':') {
            Some(after) => match after.split_once(' ') {
                Some((prefix, rest)) => (Some(prefix.to_owned()), rest),
                None => return Err(ParseError::MissingCommand),
            },
            None => (None, line),
        };

        let command = match rest.split_once(' ') {
            Some((command, tail)) => {
                rest = tail;
                command.to_owned()
            }
            None => {
                let command = rest.to_owned();
                rest = "";
                command
            }
        };
        if command.is_empty() {
            return Err(ParseError::MissingCommand);
        }

        let mut params = Vec::new();
        let mut trailing = false;
        while !rest.is_empty() {
            if let Some(text) = rest.strip_prefix(':') {
                // Trailing parameter: the remainder, spaces and all.
                params.push(text.to_owned());
                trailing = true;
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    params.push(param.to_owned());
                    rest = tail;
                }
                None => {
                    params.push(rest.to_owned());
                    break;
                }
            }
        }

        Ok(Message {
            prefix,
            command,
            params,
            trailing,
        })
    }

    /// Serialize to the wire form (without the trailing CR LF).
    ///
    /// The final parameter is written with a `:` sentinel when the message
    /// marks it as trailing, or when the receiver could not otherwise
    /// reconstruct it: it contains a space, is empty, or itself starts
    /// with `:`.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();

        if let Some(prefix) = &self.prefix {
            out.push(':');
            out.push_str(prefix);
            out.push(' ');
        }

        out.push_str(&self.command);

        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                out.push(' ');
                out.push_str(param);
            }
            out.push(' ');
            if self.trailing || last.is_empty() || last.contains(' ') || last.starts_with(':') {
                out.push(':');
            }
            out.push_str(last);
        }

        out
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_wire())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // ── Parsing ──────────────────────────────────────────────────

    #[test]
    fn parse_bare_command() {
        let msg = Message::parse("QUIT").unwrap();
        assert_eq!(msg.prefix, None);
        assert_eq!(msg.command, "QUIT");
        assert_eq!(msg.params, Vec::<String>::new());
    }

    #[test]
    fn parse_single_param() {
        let msg = Message::parse("NICK moss").unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["moss"]);
    }

    #[test]
    fn parse_trailing_param_keeps_spaces() {
        let msg = Message::parse("PRIVMSG #tarn :hello over there").unwrap();
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#tarn", "hello over there"]);
    }

    #[test]
    fn parse_prefix() {
        let msg = Message::parse(":moss!~moss@10.1.1.1 PRIVMSG #tarn :hi").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("moss!~moss@10.1.1.1"));
        assert_eq!(msg.command, "PRIVMSG");
        assert_eq!(msg.params, vec!["#tarn", "hi"]);
    }

    #[test]
    fn parse_user_registration() {
        let msg = Message::parse("USER moss 0 * :Moss Bank").unwrap();
        assert_eq!(msg.command, "USER");
        assert_eq!(msg.params, vec!["moss", "0", "*", "Moss Bank"]);
    }

    #[test]
    fn parse_numeric() {
        let msg = Message::parse(":irc.example.com 001 moss :Welcome").unwrap();
        assert_eq!(msg.prefix.as_deref(), Some("irc.example.com"));
        assert_eq!(msg.command, "001");
        assert_eq!(msg.params, vec!["moss", "Welcome"]);
    }

    #[test]
    fn parse_strips_crlf() {
        let msg = Message::parse("PING :irc.example.com\r\n").unwrap();
        assert_eq!(msg.command, "PING");
        assert_eq!(msg.params, vec!["irc.example.com"]);
    }

    #[test]
    fn parse_empty_trailing() {
        let msg = Message::parse("TOPIC #tarn :").unwrap();
        assert_eq!(msg.params, vec!["#tarn", ""]);
    }

    #[test]
    fn parse_trailing_with_leading_colon() {
        let msg = Message::parse("PRIVMSG #tarn ::)").unwrap();
        assert_eq!(msg.params, vec!["#tarn", ":)"]);
    }

    #[test]
    fn parse_middle_params() {
        let msg = Message::parse("MODE #tarn +o moss").unwrap();
        assert_eq!(msg.params, vec!["#tarn", "+o", "moss"]);
    }

    #[test]
    fn parse_records_trailing_form() {
        assert!(Message::parse("PRIVMSG #tarn :hi").unwrap().trailing);
        assert!(!Message::parse("NICK moss").unwrap().trailing);
    }

    #[test]
    fn parse_empty_line() {
        assert_eq!(Message::parse(""), Err(ParseError::Empty));
    }

    #[test]
    fn parse_prefix_without_command() {
        assert_eq!(Message::parse(":lonely"), Err(ParseError::MissingCommand));
    }

    // ── Serialization ────────────────────────────────────────────

    #[test]
    fn wire_bare_command() {
        let msg = Message {
            prefix: None,
            command: "QUIT".into(),
            params: vec![],
            trailing: false,
        };
        assert_eq!(msg.to_wire(), "QUIT");
    }

    #[test]
    fn wire_plain_last_param_has_no_sentinel() {
        let msg = Message {
            prefix: None,
            command: "JOIN".into(),
            params: vec!["#tarn".into()],
            trailing: false,
        };
        assert_eq!(msg.to_wire(), "JOIN #tarn");
    }

    #[test]
    fn wire_spaced_last_param_gets_sentinel() {
        let msg = Message {
            prefix: None,
            command: "PRIVMSG".into(),
            params: vec!["#tarn".into(), "hello over there".into()],
            trailing: false,
        };
        assert_eq!(msg.to_wire(), "PRIVMSG #tarn :hello over there");
    }

    #[test]
    fn wire_empty_last_param_gets_sentinel() {
        let msg = Message {
            prefix: None,
            command: "TOPIC".into(),
            params: vec!["#tarn".into(), "".into()],
            trailing: false,
        };
        assert_eq!(msg.to_wire(), "TOPIC #tarn :");
    }

    #[test]
    fn wire_forced_trailing_marks_single_word() {
        // A names list of one entry still serializes as a trailing param.
        let msg = Message {
            prefix: Some("irc.example.com".into()),
            command: "353".into(),
            params: vec!["moss".into(), "=".into(), "#tarn".into(), "moss".into()],
            trailing: true,
        };
        assert_eq!(msg.to_wire(), ":irc.example.com 353 moss = #tarn :moss");
    }

    #[test]
    fn wire_with_prefix() {
        let msg = Message {
            prefix: Some("irc.example.com".into()),
            command: "432".into(),
            params: vec![
                "*".into(),
                "moss".into(),
                "Nickname is already in use".into(),
            ],
            trailing: false,
        };
        assert_eq!(
            msg.to_wire(),
            ":irc.example.com 432 * moss :Nickname is already in use"
        );
    }

    // ── Round trips ──────────────────────────────────────────────

    #[test]
    fn roundtrip_join() {
        let input = ":moss!~moss@10.1.1.1 JOIN #tarn";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }

    #[test]
    fn roundtrip_privmsg() {
        let input = ":moss!~moss@10.1.1.1 PRIVMSG #tarn :morning all";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }

    #[test]
    fn roundtrip_user() {
        let input = "USER moss 0 * :Moss Bank";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }

    #[test]
    fn roundtrip_preserves_trailing_single_word() {
        // The parsed trailing form is remembered, so a one-word trailing
        // param does not collapse to a plain one.
        let input = "PRIVMSG #tarn :hi";
        let msg = Message::parse(input).unwrap();
        assert_eq!(msg.to_wire(), input);
    }
}
