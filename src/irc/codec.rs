//! CR LF framing for the IRC byte stream.
//!
//! Splits the stream on `\r\n`, parses each line into a [`Message`], and
//! serializes outgoing messages with `\r\n` termination. Lines longer than
//! [`MAX_LINE_LENGTH`] are a protocol violation and fail the decode.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, ParseError, MAX_LINE_LENGTH};

/// Codec error: a framing violation, a parse failure, or an I/O error.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("line exceeds maximum length ({MAX_LINE_LENGTH} bytes)")]
    LineTooLong,
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Frames IRC messages on `\r\n` boundaries.
#[derive(Debug, Default)]
pub struct IrcCodec;

impl Decoder for IrcCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => {
                if pos + 2 > MAX_LINE_LENGTH {
                    return Err(CodecError::LineTooLong);
                }
                let line_bytes = src.split_to(pos);
                src.advance(2);

                let line = std::str::from_utf8(&line_bytes)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

                Ok(Some(Message::parse(line)?))
            }
            // No terminator yet; a buffer past the limit can never become a
            // valid line.
            None if src.len() > MAX_LINE_LENGTH => Err(CodecError::LineTooLong),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for IrcCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let wire = message.to_wire();
        dst.reserve(wire.len() + 2);
        dst.put_slice(wire.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    // ── Decoding ─────────────────────────────────────────────────

    #[test]
    fn decode_complete_line() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK moss\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.command, "NICK");
        assert_eq!(msg.params, vec!["moss"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_terminator() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK mo");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ss\r\n");
        let msg = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.params, vec!["moss"]);
    }

    #[test]
    fn decode_two_lines_in_one_read() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from("NICK moss\r\nUSER moss 0 * :Moss Bank\r\n");

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.command, "NICK");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.command, "USER");
        assert_eq!(second.params, vec!["moss", "0", "*", "Moss Bank"]);

        assert!(buf.is_empty());
    }

    #[test]
    fn decode_empty_buffer() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_overlong_complete_line() {
        let mut codec = IrcCodec;
        let mut line = vec![b'A'; MAX_LINE_LENGTH + 10];
        line.extend_from_slice(b"\r\n");
        let mut buf = BytesMut::from(line.as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong));
    }

    #[test]
    fn decode_rejects_unterminated_overflow() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::from(vec![b'A'; MAX_LINE_LENGTH + 1].as_slice());
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::LineTooLong));
    }

    // ── Encoding ─────────────────────────────────────────────────

    #[test]
    fn encode_appends_crlf() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        let msg = Message {
            prefix: None,
            command: "JOIN".into(),
            params: vec!["#tarn".into()],
            trailing: false,
        };
        codec.encode(msg, &mut buf).unwrap();
        assert_eq!(&buf[..], b"JOIN #tarn\r\n");
    }

    #[test]
    fn encode_numeric_with_prefix() {
        let mut codec = IrcCodec;
        let mut buf = BytesMut::new();
        let msg = Message {
            prefix: Some("irc.example.com".into()),
            command: "001".into(),
            params: vec!["moss".into(), "Welcome to the network".into()],
            trailing: false,
        };
        codec.encode(msg, &mut buf).unwrap();
        assert_eq!(&buf[..], b":irc.example.com 001 moss :Welcome to the network\r\n");
    }

    // ── Round trip ───────────────────────────────────────────────

    #[test]
    fn roundtrip_through_codec() {
        let mut codec = IrcCodec;
        let original = Message {
            prefix: Some("moss!~moss@10.1.1.1".into()),
            command: "PRIVMSG".into(),
            params: vec!["#tarn".into(), "morning all".into()],
            trailing: true,
        };

        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, original);
    }
}
