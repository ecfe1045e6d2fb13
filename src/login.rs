//! Login handshake and line framing for the RBN telnet feed.
//!
//! The server greets with a few banner lines and then prints a callsign
//! prompt, usually without a trailing newline. [`LineBuffer`] frames the raw
//! byte stream into lines while exposing the unterminated remainder, and
//! [`Handshake`] decides what each line means: the prompt that triggers the
//! login, a spot to aggregate, or noise.

use std::time::Instant;
use tracing::debug;

use crate::parser::{looks_like_spot, parse_spot_at};
use crate::spot::RawSpot;

/// Substring of the server's callsign prompt, matched case-insensitively.
pub const LOGIN_PROMPT: &str = "please enter your call";

/// Where a connection is in the login sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    /// Waiting for the callsign prompt. Lines are not parsed as spots.
    AwaitingPrompt,
    /// Callsign sent; every line is checked for spots.
    LoggedIn,
}

/// What the connection should do with one line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum LineAction {
    /// The prompt was seen. Write this text (callsign plus CRLF) to the server.
    SendLogin(String),
    /// A successfully parsed spot.
    Spot(RawSpot),
    /// A line with the spot prefix that failed the grammar.
    Rejected,
    /// Banner text, blank lines, or anything without the spot prefix.
    Ignored,
}

/// Per-connection login state machine.
///
/// The prompt check is armed once per connection. Create a new `Handshake`
/// for every new connection.
#[derive(Debug)]
pub struct Handshake {
    callsign: String,
    state: LoginState,
}

impl Handshake {
    pub fn new(callsign: impl Into<String>) -> Self {
        Self {
            callsign: callsign.into(),
            state: LoginState::AwaitingPrompt,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    /// The bytes sent in response to the prompt.
    pub fn login_line(&self) -> String {
        format!("{}\r\n", self.callsign)
    }

    /// Handle one complete line received at `received`.
    pub fn process_line(&mut self, line: &str, received: Instant) -> LineAction {
        match self.state {
            LoginState::AwaitingPrompt => {
                if self.check_prompt(line) {
                    LineAction::SendLogin(self.login_line())
                } else {
                    LineAction::Ignored
                }
            }
            LoginState::LoggedIn => {
                if !looks_like_spot(line) {
                    return LineAction::Ignored;
                }
                match parse_spot_at(line, received) {
                    Ok(spot) => LineAction::Spot(spot),
                    Err(e) => {
                        debug!("Parse error for '{}': {}", line.trim_end(), e);
                        LineAction::Rejected
                    }
                }
            }
        }
    }

    /// Check an unterminated remainder for the prompt.
    ///
    /// Returns the login text to send when the prompt is found. Only fires
    /// while awaiting the prompt.
    pub fn process_partial(&mut self, pending: &str) -> Option<String> {
        if self.state == LoginState::AwaitingPrompt && self.check_prompt(pending) {
            Some(self.login_line())
        } else {
            None
        }
    }

    fn check_prompt(&mut self, text: &str) -> bool {
        if text.to_ascii_lowercase().contains(LOGIN_PROMPT) {
            self.state = LoginState::LoggedIn;
            true
        } else {
            false
        }
    }
}

/// Longest unterminated remainder kept while waiting for a newline.
///
/// RBN lines are under 100 bytes; anything longer is not a line we can use.
pub const MAX_PENDING: usize = 4096;

/// Splits a byte stream into `\n`-terminated lines.
///
/// Bytes are buffered until a newline arrives so multi-byte characters split
/// across reads decode correctly. Invalid UTF-8 is replaced, not rejected.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the socket.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the next complete line, without its line terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.buf.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&raw);
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// The unterminated remainder, decoded lossily.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Drop the remainder if it has grown past [`MAX_PENDING`].
    ///
    /// Call after draining complete lines. Returns the number of bytes
    /// discarded.
    pub fn discard_overflow(&mut self) -> usize {
        if self.buf.len() <= MAX_PENDING {
            return 0;
        }
        let discarded = self.buf.len();
        self.buf.clear();
        discarded
    }
}
