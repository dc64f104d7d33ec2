//! Control-channel line codec.
//!
//! The radio's control channel is line-oriented text over TCP. Lines from
//! the radio start with a one-character frame tag:
//!
//! ```text
//! Version:   V<major>.<minor>.<build>.<sub>
//! Handle:    H<hex_handle>
//! Status:    S<hex_handle>|<status_body>
//! Message:   M<level>|<text>
//! Response:  R<seq>|<hex_code>|<message>
//! Queued:    Q<seq>|<hex_code>|<message>
//! Command:   C<seq>|<command_body>
//! ```
//!
//! Outgoing commands are framed `C<seq>|<command>\n`, or
//! `C<seq>|@<secs>.<usecs>|<command>\n` for commands scheduled at a
//! wall-clock instant. The sequence counter is 31 bits wide; the 32nd bit
//! is always clear.
//!
//! Everything in this module is pure parsing and formatting -- no I/O.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use flexwave_core::{Error, Result};

/// Mask applied to the command sequence counter: 31 bits, top bit clear.
pub const SEQUENCE_MASK: u32 = 0x7FFF_FFFF;

/// Advance a command sequence number, wrapping at 2^31.
pub fn next_sequence(prev: u32) -> u32 {
    prev.wrapping_add(1) & SEQUENCE_MASK
}

/// Radio API version from the connection handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub sub: u32,
}

/// A decoded line from the radio's control channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Handshake version line.
    Version(ApiVersion),
    /// Handshake session handle.
    Handle(u32),
    /// Unsolicited status update addressed to a session handle.
    Status { handle: u32, body: String },
    /// Radio log message, forwarded to the log sink.
    LogMessage(String),
    /// Final response to a previously-sent command.
    Response {
        sequence: u32,
        code: u32,
        message: String,
    },
    /// Queued acknowledgement of a time-scheduled command.
    Queued {
        sequence: u32,
        code: u32,
        message: String,
    },
    /// A command the radio originated for the waveform.
    Command { sequence: u32, body: String },
}

/// Parse one control line (without its terminator).
pub fn parse_line(line: &str) -> Result<ControlMessage> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(Error::Protocol("empty control line".into()));
    }

    let tag = line.as_bytes()[0];
    if !tag.is_ascii() {
        return Err(Error::Protocol(format!("unknown control tag in: {line}")));
    }
    let body = &line[1..];
    match tag {
        b'V' => parse_version(body),
        b'H' => parse_handle(body),
        b'S' => parse_status(body),
        b'M' => Ok(parse_log(body)),
        b'R' => parse_correlated(body).map(|(sequence, code, message)| ControlMessage::Response {
            sequence,
            code,
            message,
        }),
        b'Q' => parse_correlated(body).map(|(sequence, code, message)| ControlMessage::Queued {
            sequence,
            code,
            message,
        }),
        b'C' => parse_command(body),
        other => Err(Error::Protocol(format!(
            "unknown control tag '{}' in: {line}",
            other as char
        ))),
    }
}

/// `V<maj>.<min>.<build>.<sub>`
fn parse_version(body: &str) -> Result<ControlMessage> {
    let mut parts = body.split('.');
    let mut next = || -> Result<u32> {
        parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::Protocol(format!("invalid version: {body}")))
    };
    let version = ApiVersion {
        major: next()?,
        minor: next()?,
        build: next()?,
        sub: next()?,
    };
    if parts.next().is_some() {
        return Err(Error::Protocol(format!("invalid version: {body}")));
    }
    Ok(ControlMessage::Version(version))
}

/// `H<hex_handle>`
fn parse_handle(body: &str) -> Result<ControlMessage> {
    let handle = u32::from_str_radix(body, 16)
        .map_err(|_| Error::Protocol(format!("invalid session handle: {body}")))?;
    Ok(ControlMessage::Handle(handle))
}

/// `S<hex_handle>|<status_body>`
fn parse_status(body: &str) -> Result<ControlMessage> {
    let (handle_str, status) = body
        .split_once('|')
        .ok_or_else(|| Error::Protocol(format!("status line has no body: {body}")))?;
    let handle = u32::from_str_radix(handle_str, 16)
        .map_err(|_| Error::Protocol(format!("invalid status handle: {handle_str}")))?;
    Ok(ControlMessage::Status {
        handle,
        body: status.to_string(),
    })
}

/// `M<level>|<text>` -- the level is opaque to us; keep the text.
fn parse_log(body: &str) -> ControlMessage {
    let text = body.split_once('|').map(|(_, t)| t).unwrap_or(body);
    ControlMessage::LogMessage(text.to_string())
}

/// `<seq>|<hex_code>|<message>` shared by `R` and `Q` frames. The code is
/// base-16 per the frame grammar.
fn parse_correlated(body: &str) -> Result<(u32, u32, String)> {
    let mut parts = body.splitn(3, '|');
    let seq_str = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("response has no sequence: {body}")))?;
    let sequence = seq_str
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("invalid response sequence: {seq_str}")))?;

    let code_str = parts
        .next()
        .ok_or_else(|| Error::Protocol(format!("response has no code: {body}")))?;
    let code = u32::from_str_radix(code_str, 16)
        .map_err(|_| Error::Protocol(format!("invalid response code: {code_str}")))?;

    let message = parts.next().unwrap_or("").to_string();
    Ok((sequence, code, message))
}

/// `C<seq>|<command_body>`
fn parse_command(body: &str) -> Result<ControlMessage> {
    let (seq_str, command) = body
        .split_once('|')
        .ok_or_else(|| Error::Protocol(format!("command line has no body: {body}")))?;
    let sequence = seq_str
        .parse::<u32>()
        .map_err(|_| Error::Protocol(format!("invalid command sequence: {seq_str}")))?;
    Ok(ControlMessage::Command {
        sequence,
        body: command.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Emit
// ---------------------------------------------------------------------------

/// Frame an immediate command: `C<seq>|<command>\n`.
pub fn encode_command(sequence: u32, command: &str) -> Vec<u8> {
    format!("C{}|{}\n", sequence & SEQUENCE_MASK, command).into_bytes()
}

/// Frame a time-scheduled command: `C<seq>|@<secs>.<usecs>|<command>\n`.
///
/// `at` encodes the wall-clock instant the radio should execute the
/// command; instants before the epoch clamp to it.
pub fn encode_timed_command(sequence: u32, at: SystemTime, command: &str) -> Vec<u8> {
    let since_epoch = at
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    format!(
        "C{}|@{}.{:06}|{}\n",
        sequence & SEQUENCE_MASK,
        since_epoch.as_secs(),
        since_epoch.subsec_micros(),
        command
    )
    .into_bytes()
}

/// Quote a value for embedding in a command when it contains whitespace or
/// quotes, the way the radio's tokenizer will undo it.
pub fn quote(value: &str) -> String {
    if value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"') {
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- sequence counter --

    #[test]
    fn sequence_increments() {
        assert_eq!(next_sequence(0), 1);
        assert_eq!(next_sequence(41), 42);
    }

    #[test]
    fn sequence_wraps_at_31_bits() {
        assert_eq!(next_sequence(0x7FFF_FFFF), 0);
        // The 32nd bit never survives.
        for seq in [0u32, 1, 0x7FFF_FFFE, 0x7FFF_FFFF] {
            assert_eq!(next_sequence(seq) & 0x8000_0000, 0);
        }
    }

    // -- parse: handshake --

    #[test]
    fn parse_version_line() {
        let msg = parse_line("V1.2.3.4").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Version(ApiVersion {
                major: 1,
                minor: 2,
                build: 3,
                sub: 4
            })
        );
    }

    #[test]
    fn parse_version_rejects_bad_forms() {
        assert!(parse_line("V1.2.3").is_err());
        assert!(parse_line("V1.2.3.4.5").is_err());
        assert!(parse_line("Vx.2.3.4").is_err());
    }

    #[test]
    fn parse_handle_line() {
        let msg = parse_line("H0000ABCD").unwrap();
        assert_eq!(msg, ControlMessage::Handle(0xABCD));
    }

    #[test]
    fn parse_handle_rejects_non_hex() {
        assert!(parse_line("Hxyz").is_err());
    }

    // -- parse: status --

    #[test]
    fn parse_status_line() {
        let msg = parse_line("S12345678|slice 1 mode=JUNK").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Status {
                handle: 0x1234_5678,
                body: "slice 1 mode=JUNK".to_string()
            }
        );
    }

    #[test]
    fn parse_status_requires_pipe() {
        assert!(parse_line("S12345678 slice").is_err());
    }

    // -- parse: responses --

    #[test]
    fn parse_response_line() {
        let msg = parse_line("R0|00000000|ok").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Response {
                sequence: 0,
                code: 0,
                message: "ok".to_string()
            }
        );
    }

    #[test]
    fn parse_response_code_is_hex() {
        let msg = parse_line("R17|50000015|Invalid slice").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Response {
                sequence: 17,
                code: 0x5000_0015,
                message: "Invalid slice".to_string()
            }
        );
    }

    #[test]
    fn parse_response_without_message() {
        let msg = parse_line("R5|0").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Response {
                sequence: 5,
                code: 0,
                message: String::new()
            }
        );
    }

    #[test]
    fn parse_response_message_may_contain_pipes() {
        let msg = parse_line("R5|0|a|b|c").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Response {
                sequence: 5,
                code: 0,
                message: "a|b|c".to_string()
            }
        );
    }

    #[test]
    fn parse_queued_line() {
        let msg = parse_line("Q42|00000000|queued").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Queued {
                sequence: 42,
                code: 0,
                message: "queued".to_string()
            }
        );
    }

    // -- parse: radio command --

    #[test]
    fn parse_command_line() {
        let msg = parse_line("C99|slice 1 set mode=USB").unwrap();
        assert_eq!(
            msg,
            ControlMessage::Command {
                sequence: 99,
                body: "slice 1 set mode=USB".to_string()
            }
        );
    }

    // -- parse: log + junk --

    #[test]
    fn parse_log_line() {
        let msg = parse_line("M10000001|client disconnected").unwrap();
        assert_eq!(
            msg,
            ControlMessage::LogMessage("client disconnected".to_string())
        );
    }

    #[test]
    fn parse_strips_line_endings() {
        let msg = parse_line("H00000001\r\n").unwrap();
        assert_eq!(msg, ControlMessage::Handle(1));
    }

    #[test]
    fn parse_rejects_unknown_tag() {
        assert!(parse_line("X1|whatever").is_err());
        assert!(parse_line("").is_err());
    }

    // -- emit --

    #[test]
    fn encode_immediate_command() {
        let wire = encode_command(0, "filt 0 100 3000");
        assert_eq!(wire, b"C0|filt 0 100 3000\n");
    }

    #[test]
    fn encode_command_masks_top_bit() {
        let wire = encode_command(0x8000_0001, "info");
        assert_eq!(wire, b"C1|info\n");
    }

    #[test]
    fn encode_timed() {
        let at = UNIX_EPOCH + Duration::new(1_700_000_000, 250_000_000);
        let wire = encode_timed_command(7, at, "xmit 1");
        assert_eq!(wire, b"C7|@1700000000.250000|xmit 1\n");
    }

    #[test]
    fn encode_timed_pads_microseconds() {
        let at = UNIX_EPOCH + Duration::new(100, 1_000);
        let wire = encode_timed_command(1, at, "x");
        assert_eq!(wire, b"C1|@100.000001|x\n");
    }

    // -- quoting --

    #[test]
    fn quote_plain_value_unchanged() {
        assert_eq!(quote("USB"), "USB");
    }

    #[test]
    fn quote_wraps_whitespace() {
        assert_eq!(quote("two words"), "\"two words\"");
    }

    #[test]
    fn quote_escapes_embedded_quotes() {
        assert_eq!(quote("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn quote_round_trips_through_tokenizer() {
        let argv =
            flexwave_core::split_args(&format!("set label={}", quote("two words"))).unwrap();
        assert_eq!(argv, vec!["set", "label=two words"]);
    }
}
