//! Control-channel command codec.
//!
//! The control channel carries newline-terminated UTF-8 lines:
//!
//! ```text
//! name[marker id] [param ...]\n
//!
//! marker:  ?  request, the peer expects a reply carrying `id`
//!          .  reply to request `id`
//!          !  failure of request `id` (the id may be empty)
//! ```
//!
//! Parameters are separated by spaces or tabs. A parameter containing
//! whitespace, quotes or backslashes is written in double quotes, with `\"`,
//! `\\`, `\n` and `\t` escapes.
//!
//! Lines longer than [`MAX_LINE_LENGTH`] bytes are rejected by the server
//! before they reach the parser.

use std::fmt;
use thiserror::Error;

/// Longest accepted control line, newline excluded
pub const MAX_LINE_LENGTH: usize = 16 * 1024;

/// Framing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Blank line
    #[error("Empty command line")]
    Empty,

    /// Line starts with a marker instead of a name
    #[error("Missing command name")]
    MissingName,

    /// Name contains characters outside `[A-Za-z0-9_-]`
    #[error("Invalid command name: {0}")]
    InvalidName(String),

    /// Request or reply marker without an exchange id
    #[error("Missing exchange id")]
    MissingExchangeId,

    /// Quoted parameter runs to end of line
    #[error("Unterminated quoted parameter")]
    UnterminatedQuote,

    /// Unsupported escape inside a quoted parameter
    #[error("Invalid escape sequence: \\{0}")]
    InvalidEscape(char),

    /// Line is not UTF-8 text
    #[error("Command line is not valid UTF-8")]
    InvalidUtf8,

    /// Line exceeds [`MAX_LINE_LENGTH`]
    #[error("Command line exceeds {MAX_LINE_LENGTH} bytes")]
    LineTooLong,
}

/// How a command relates to an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Fire-and-forget
    Event,
    /// Expects a reply
    Request,
    /// Answers a request
    Reply,
    /// Reports that a request failed
    Failure,
}

impl CommandKind {
    fn marker(self) -> Option<char> {
        match self {
            Self::Event => None,
            Self::Request => Some('?'),
            Self::Reply => Some('.'),
            Self::Failure => Some('!'),
        }
    }

    fn from_marker(marker: char) -> Option<Self> {
        match marker {
            '?' => Some(Self::Request),
            '.' => Some(Self::Reply),
            '!' => Some(Self::Failure),
            _ => None,
        }
    }
}

/// One control-channel command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name
    pub name: String,
    /// Exchange role
    pub kind: CommandKind,
    /// Exchange id for requests, replies and correlated failures
    pub exchange_id: Option<String>,
    /// Positional parameters
    pub params: Vec<String>,
}

impl Command {
    /// Fire-and-forget command
    #[must_use]
    pub fn event(name: impl Into<String>, params: Vec<String>) -> Self {
        Self {
            name: name.into(),
            kind: CommandKind::Event,
            exchange_id: None,
            params,
        }
    }

    /// Request expecting a reply tagged with `exchange_id`
    #[must_use]
    pub fn request(
        name: impl Into<String>,
        exchange_id: impl Into<String>,
        params: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: CommandKind::Request,
            exchange_id: Some(exchange_id.into()),
            params,
        }
    }

    /// Reply to a request, or a plain event when there is no exchange
    #[must_use]
    pub fn reply(name: impl Into<String>, exchange_id: Option<String>, params: Vec<String>) -> Self {
        let kind = if exchange_id.is_some() {
            CommandKind::Reply
        } else {
            CommandKind::Event
        };
        Self {
            name: name.into(),
            kind,
            exchange_id,
            params,
        }
    }

    /// Failure carrying a human-readable message
    #[must_use]
    pub fn failure(name: impl Into<String>, exchange_id: Option<String>, message: &str) -> Self {
        Self {
            name: name.into(),
            kind: CommandKind::Failure,
            exchange_id,
            params: vec![message.to_string()],
        }
    }

    /// Parameter at `index`
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Parse one line, with or without its trailing newline.
    ///
    /// # Errors
    ///
    /// Returns a [`CodecError`] describing the first framing problem found.
    pub fn parse(line: &str) -> Result<Self, CodecError> {
        let line = line.trim_end_matches(['\n', '\r']);
        if line.len() > MAX_LINE_LENGTH {
            return Err(CodecError::LineTooLong);
        }

        let line = line.trim_start_matches(is_separator);
        if line.is_empty() {
            return Err(CodecError::Empty);
        }

        let (head, rest) = line.split_once(is_separator).unwrap_or((line, ""));
        let (name, kind, exchange_id) = match head.find(['?', '.', '!']) {
            Some(at) => {
                let marker = head[at..].chars().next().unwrap_or('?');
                let kind = CommandKind::from_marker(marker).unwrap_or(CommandKind::Request);
                let id = &head[at + 1..];
                let exchange_id = match (kind, id.is_empty()) {
                    (CommandKind::Failure, true) => None,
                    (_, true) => return Err(CodecError::MissingExchangeId),
                    (_, false) => Some(id.to_string()),
                };
                (&head[..at], kind, exchange_id)
            }
            None => (head, CommandKind::Event, None),
        };

        if name.is_empty() {
            return Err(CodecError::MissingName);
        }
        if !name.bytes().all(is_name_byte) {
            return Err(CodecError::InvalidName(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            kind,
            exchange_id,
            params: split_params(rest)?,
        })
    }

    /// Encode as a newline-terminated line
    #[must_use]
    pub fn encode(&self) -> String {
        let mut line = self.to_string();
        line.push('\n');
        line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(marker) = self.kind.marker() {
            write!(f, "{marker}{}", self.exchange_id.as_deref().unwrap_or(""))?;
        }
        for param in &self.params {
            f.write_str(" ")?;
            write_param(f, param)?;
        }
        Ok(())
    }
}

fn is_separator(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'_'
}

fn split_params(input: &str) -> Result<Vec<String>, CodecError> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while chars.next_if(|&c| is_separator(c)).is_some() {}
        let Some(&first) = chars.peek() else {
            return Ok(params);
        };

        let mut param = String::new();
        if first == '"' {
            chars.next();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some('"') => param.push('"'),
                        Some('\\') => param.push('\\'),
                        Some('n') => param.push('\n'),
                        Some('t') => param.push('\t'),
                        Some(other) => return Err(CodecError::InvalidEscape(other)),
                        None => return Err(CodecError::UnterminatedQuote),
                    },
                    Some(c) => param.push(c),
                    None => return Err(CodecError::UnterminatedQuote),
                }
            }
        } else {
            while let Some(c) = chars.next_if(|&c| !is_separator(c)) {
                param.push(c);
            }
        }
        params.push(param);
    }
}

fn needs_quoting(param: &str) -> bool {
    param.is_empty()
        || param.starts_with('"')
        || param
            .chars()
            .any(|c| is_separator(c) || c == '\\' || c == '"' || c.is_control())
}

fn write_param(f: &mut fmt::Formatter<'_>, param: &str) -> fmt::Result {
    if !needs_quoting(param) {
        return f.write_str(param);
    }

    f.write_str("\"")?;
    for c in param.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\t' => f.write_str("\\t")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}
