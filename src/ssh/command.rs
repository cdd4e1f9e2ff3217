//! Parsing and validation of `exec` request payloads.
//!
//! A Git client runs e.g. `ssh host "git-upload-pack 'team/widgets.git'"`;
//! the command line arrives as an SSH string (four-byte big-endian length,
//! then the bytes).  It is shell-split, the first word is checked against
//! the fixed set of [`Operation`]s, and the second word names the repository.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Width of the length prefix in front of the command line.
const LENGTH_PREFIX: usize = 4;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why an `exec` payload could not be turned into a command.  The client may
/// retry on the same channel.
#[derive(Debug, Error)]
pub enum MalformedCommand {
    #[error("payload of {0} byte(s) is shorter than its length prefix")]
    Truncated(usize),
    #[error("command line is not valid UTF-8")]
    NotUtf8,
    #[error("cannot split command line: {0}")]
    Quoting(#[from] shell_words::ParseError),
    #[error("expected an operation and a repository, got {0} word(s)")]
    TooFewWords(usize),
}

/// Request-level rejections.  The `Display` text of the last two variants is
/// sent verbatim to the client's stderr.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Malformed(#[from] MalformedCommand),
    #[error("'{0}' is not a supported command")]
    UnsupportedOperation(String),
    #[error("'{0}' is not a valid repository")]
    InvalidRepository(String),
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// The repository operations the gateway is willing to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    UploadPack,
    UploadArchive,
    ReceivePack,
}

impl Operation {
    pub const ALL: [Operation; 3] = [
        Operation::UploadPack,
        Operation::UploadArchive,
        Operation::ReceivePack,
    ];

    /// Program name, which is also the command word clients send.
    pub fn name(self) -> &'static str {
        match self {
            Self::UploadPack => "git-upload-pack",
            Self::UploadArchive => "git-upload-archive",
            Self::ReceivePack => "git-receive-pack",
        }
    }

    /// Exact, case-sensitive whitelist lookup.
    pub fn from_name(name: &str) -> Result<Self, CommandError> {
        Self::ALL
            .into_iter()
            .find(|op| op.name() == name)
            .ok_or_else(|| CommandError::UnsupportedOperation(name.to_string()))
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Command line
// ---------------------------------------------------------------------------

/// A shell-split command line with at least two words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    words: Vec<String>,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, MalformedCommand> {
        let words = shell_words::split(line)?;
        if words.len() < 2 {
            return Err(MalformedCommand::TooFewWords(words.len()));
        }
        Ok(Self { words })
    }

    pub fn operation(&self) -> &str {
        &self.words[0]
    }

    pub fn repository(&self) -> &str {
        &self.words[1]
    }

    /// Trailing words; accepted but never passed on.
    pub fn extra_args(&self) -> &[String] {
        &self.words[2..]
    }
}

/// Strip the length prefix from an `exec` payload.  The length value itself
/// is not checked.
pub fn decode_exec_payload(payload: &[u8]) -> Result<&str, MalformedCommand> {
    let line = payload
        .get(LENGTH_PREFIX..)
        .ok_or(MalformedCommand::Truncated(payload.len()))?;
    std::str::from_utf8(line).map_err(|_| MalformedCommand::NotUtf8)
}

/// Frame a command line the way it travels in an `exec` request.
pub fn encode_exec_payload(command: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + command.len());
    buf.put_u32(command.len() as u32);
    buf.put_slice(command);
    buf.freeze()
}

pub fn parse_exec_payload(payload: &[u8]) -> Result<Command, MalformedCommand> {
    Command::parse(decode_exec_payload(payload)?)
}

// ---------------------------------------------------------------------------
// Repository paths
// ---------------------------------------------------------------------------

/// Join a client-supplied repository identifier onto `root`.
///
/// Leading slashes are always dropped (`ssh://host/repo.git` arrives as
/// `/repo.git`).  In strict mode the remainder must be a single plain path
/// component.  Otherwise it is joined as-is, `..` segments included.
pub fn resolve_repository(root: &Path, id: &str, strict: bool) -> Result<PathBuf, CommandError> {
    let relative = id.trim_start_matches('/');
    if strict && !is_plain_component(relative) {
        return Err(CommandError::InvalidRepository(id.to_string()));
    }
    Ok(root.join(relative))
}

fn is_plain_component(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
