//! Controller protocol message types.
//!
//! Every WebSocket text frame carries one JSON object. Inbound frames are
//! [`Instruction`]s discriminated by their `type` field; each recognised
//! instruction produces at most one [`Response`] frame. There is no request
//! id: responses correlate to instructions by order alone.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Leading character on the executable token that marks a command optional.
pub const OPTIONAL_MARKER: char = '-';

/// Instruction received from the controller.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Instruction {
    /// Ask for repository, run and home directory details.
    #[serde(alias = "details-request")]
    Details,

    /// Run a foreground command and wait for it.
    #[serde(alias = "run-command")]
    Command {
        command: Vec<String>,
        #[serde(default)]
        optional: bool,
    },

    /// Spawn a detached command tracked under a caller-chosen id.
    #[serde(alias = "run-background-command")]
    BackgroundCommand { id: String, command: Vec<String> },

    /// Set an environment variable for every later command.
    SetEnv { name: String, value: String },

    /// Write a file relative to the workspace.
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        encoding: ContentEncoding,
    },

    /// Read a file relative to the workspace.
    ReadFile { path: String },

    /// Forward a message to the job log.
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
    },

    /// Evaluate an expression with the given variables.
    #[serde(alias = "evaluate")]
    Eval {
        expression: String,
        #[serde(default)]
        variables: Map<String, Value>,
    },

    SaveCache { key: String, paths: BTreeSet<String> },

    RestoreCache { key: String, paths: BTreeSet<String> },

    /// Register a value to be masked in the job log.
    #[serde(alias = "mask-secret")]
    Mask { value: String },

    /// Open a log group when titled, close the current one otherwise.
    Group {
        #[serde(default)]
        title: Option<String>,
    },

    /// Any kind this agent does not know. Dropped without a response.
    #[serde(other)]
    Unknown,
}

/// How `write-file` content is transported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    Utf8,
    Base64,
}

/// Severity of a `log` instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warning,
    Info,
    Debug,
}

/// Every `type` value this agent understands, aliases included.
const KNOWN_KINDS: &[&str] = &[
    "details",
    "details-request",
    "command",
    "run-command",
    "background-command",
    "run-background-command",
    "set-env",
    "write-file",
    "read-file",
    "log",
    "eval",
    "evaluate",
    "save-cache",
    "restore-cache",
    "mask",
    "mask-secret",
    "group",
];

/// Failure to turn a frame into an [`Instruction`].
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed instruction frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid '{kind}' instruction: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("instruction '{0}' carries an empty command")]
    EmptyCommand(&'static str),
}

impl ProtocolError {
    /// The frame named a kind this agent knows, so the controller is
    /// waiting on an answer even though the payload was rejected.
    pub const fn expects_response(&self) -> bool {
        matches!(self, Self::InvalidPayload { .. } | Self::EmptyCommand(_))
    }
}

impl Instruction {
    /// Decode a raw text frame.
    ///
    /// Unknown kinds decode to [`Instruction::Unknown`]; everything else that
    /// does not match the protocol is an error. A known kind with a bad
    /// payload is reported as [`ProtocolError::InvalidPayload`].
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(frame)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .and_then(|name| KNOWN_KINDS.iter().copied().find(|known| *known == name));
        let instruction: Self = serde_json::from_value(value).map_err(|source| match kind {
            Some(kind) => ProtocolError::InvalidPayload { kind, source },
            None => ProtocolError::Malformed(source),
        })?;
        match &instruction {
            Self::Command { command, .. } if command.is_empty() => {
                Err(ProtocolError::EmptyCommand("command"))
            }
            Self::BackgroundCommand { command, .. } if command.is_empty() => {
                Err(ProtocolError::EmptyCommand("background-command"))
            }
            _ => Ok(instruction),
        }
    }

    /// Short name used in logs.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Details => "details",
            Self::Command { .. } => "command",
            Self::BackgroundCommand { .. } => "background-command",
            Self::SetEnv { .. } => "set-env",
            Self::WriteFile { .. } => "write-file",
            Self::ReadFile { .. } => "read-file",
            Self::Log { .. } => "log",
            Self::Eval { .. } => "eval",
            Self::SaveCache { .. } => "save-cache",
            Self::RestoreCache { .. } => "restore-cache",
            Self::Mask { .. } => "mask",
            Self::Group { .. } => "group",
            Self::Unknown => "unknown",
        }
    }
}

/// A command line split into program and arguments, with the optional
/// marker resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub optional: bool,
}

impl CommandLine {
    /// Build from argv tokens. A leading [`OPTIONAL_MARKER`] on the program
    /// is stripped and sets `optional`, same as the explicit flag.
    ///
    /// Returns `None` for an empty argv.
    pub fn parse(argv: &[String], optional: bool) -> Option<Self> {
        let (first, rest) = argv.split_first()?;
        let (program, marked) = first
            .strip_prefix(OPTIONAL_MARKER)
            .map_or((first.as_str(), false), |stripped| (stripped, true));
        Some(Self {
            program: program.to_string(),
            args: rest.to_vec(),
            optional: optional || marked,
        })
    }

    /// The command as the controller would print it.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Response sent back for one instruction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Details {
        repository: String,
        id: u64,
        #[serde(rename = "userHome")]
        user_home: String,
    },
    Stdout {
        stdout: String,
    },
    Stderr {
        stderr: String,
    },
    Output {
        output: String,
    },
    File {
        file: String,
    },
    Result {
        result: Value,
    },
    CacheId {
        id: i64,
    },
    Error {
        error: String,
    },
    Empty {},
}

impl Response {
    pub const fn empty() -> Self {
        Self::Empty {}
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// Encode as a text frame.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
