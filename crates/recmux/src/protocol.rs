//! Line protocol for recorder control.
//!
//! Each command is exactly one UTF-8 line, newline-terminated. The
//! channel is deliberately human-readable: an operator can drive a
//! single recorder by typing into its stdin, and a captured pipe reads
//! as a transcript of the session.

use std::fmt;
use std::io;
use std::str::FromStr;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// A lifecycle command understood by recorder processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin recording.
    Start,
    /// Stop recording after the given number of seconds.
    StopAfter(u64),
    /// Stop recording now; the process stays alive for further commands.
    Stop,
    /// Ask the process to exit on its own initiative.
    Quit,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => f.write_str("START"),
            Command::StopAfter(secs) => write!(f, "STOP_AFTER {secs}"),
            Command::Stop => f.write_str("STOP"),
            Command::Quit => f.write_str("QUIT"),
        }
    }
}

/// Local encode/decode fault. Surfaced to the caller before anything is
/// written to a worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("unknown command: '{0}'")]
    UnknownCommand(String),

    #[error("malformed argument for {command}: {reason}")]
    MalformedArgument {
        command: &'static str,
        reason: String,
    },
}

impl FromStr for Command {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        let Some(head) = tokens.next() else {
            return Err(ProtocolError::UnknownCommand(String::new()));
        };

        // Recorders accept commands case-insensitively; so does the
        // supervisor's own decoder.
        if head.eq_ignore_ascii_case("STOP_AFTER") {
            let arg = tokens
                .next()
                .ok_or_else(|| ProtocolError::MalformedArgument {
                    command: "STOP_AFTER",
                    reason: "missing seconds".to_string(),
                })?;
            if tokens.next().is_some() {
                return Err(ProtocolError::MalformedArgument {
                    command: "STOP_AFTER",
                    reason: "trailing tokens after seconds".to_string(),
                });
            }
            let secs = arg
                .parse::<u64>()
                .map_err(|e| ProtocolError::MalformedArgument {
                    command: "STOP_AFTER",
                    reason: format!("'{arg}': {e}"),
                })?;
            return Ok(Command::StopAfter(secs));
        }

        if tokens.next().is_some() {
            return Err(ProtocolError::UnknownCommand(line.to_string()));
        }

        if head.eq_ignore_ascii_case("START") {
            Ok(Command::Start)
        } else if head.eq_ignore_ascii_case("STOP") {
            Ok(Command::Stop)
        } else if head.eq_ignore_ascii_case("QUIT") {
            Ok(Command::Quit)
        } else {
            Err(ProtocolError::UnknownCommand(line.to_string()))
        }
    }
}

/// Newline-framed codec for [`Command`] values.
///
/// Wraps [`LinesCodec`] and adds command parsing on top. Works over any
/// AsyncRead/AsyncWrite; here it frames writes to a child's stdin.
#[derive(Debug, Default)]
pub struct CommandCodec {
    inner: LinesCodec,
}

impl CommandCodec {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new(),
        }
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, io::Error> {
        match self.inner.decode(src).map_err(lines_error)? {
            Some(line) => {
                let command = line
                    .parse()
                    .map_err(|e: ProtocolError| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(command))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), io::Error> {
        self.inner.encode(item.to_string(), dst).map_err(lines_error)
    }
}

fn lines_error(err: LinesCodecError) -> io::Error {
    match err {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "max line length exceeded")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_is_one_uppercase_token_per_command() {
        assert_eq!(Command::Start.to_string(), "START");
        assert_eq!(Command::Stop.to_string(), "STOP");
        assert_eq!(Command::Quit.to_string(), "QUIT");
        assert_eq!(Command::StopAfter(5).to_string(), "STOP_AFTER 5");
        assert_eq!(Command::StopAfter(0).to_string(), "STOP_AFTER 0");
    }

    #[test]
    fn decode_encode_round_trip() {
        for command in [
            Command::Start,
            Command::Stop,
            Command::Quit,
            Command::StopAfter(0),
            Command::StopAfter(42),
        ] {
            let decoded: Command = command.to_string().parse().unwrap();
            assert_eq!(decoded, command);
        }
    }

    #[test]
    fn decode_is_case_insensitive() {
        assert_eq!("start".parse::<Command>().unwrap(), Command::Start);
        assert_eq!("stop_after 3".parse::<Command>().unwrap(), Command::StopAfter(3));
    }

    #[test]
    fn decode_trims_surrounding_whitespace() {
        assert_eq!("  STOP \n".parse::<Command>().unwrap(), Command::Stop);
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = "PAUSE".parse::<Command>().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownCommand("PAUSE".to_string()));

        let err = "START now".parse::<Command>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(_)));
    }

    #[test]
    fn stop_after_requires_a_numeric_argument() {
        assert!(matches!(
            "STOP_AFTER".parse::<Command>(),
            Err(ProtocolError::MalformedArgument { command: "STOP_AFTER", .. })
        ));
        assert!(matches!(
            "STOP_AFTER soon".parse::<Command>(),
            Err(ProtocolError::MalformedArgument { .. })
        ));
        assert!(matches!(
            "STOP_AFTER -5".parse::<Command>(),
            Err(ProtocolError::MalformedArgument { .. })
        ));
        assert!(matches!(
            "STOP_AFTER 5 6".parse::<Command>(),
            Err(ProtocolError::MalformedArgument { .. })
        ));
    }

    #[test]
    fn codec_frames_commands_as_lines() {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Command::StopAfter(7), &mut buf).unwrap();
        assert_eq!(&buf[..], b"STOP_AFTER 7\n");

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Command::StopAfter(7));
    }

    #[test]
    fn codec_waits_for_a_complete_line() {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::from(&b"STA"[..]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"RT\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Command::Start));
    }

    #[test]
    fn codec_surfaces_protocol_errors_as_invalid_data() {
        let mut codec = CommandCodec::new();
        let mut buf = BytesMut::from(&b"NOPE\n"[..]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
