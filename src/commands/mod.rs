pub mod config;
pub mod del;
pub mod executable;
pub mod get;
pub mod set;

use bytes::Bytes;
use std::{str, vec};
use thiserror::Error as ThisError;

use crate::commands::executable::Executable;
use crate::frame::Frame;
use crate::store::Store;

use config::Config;
use del::Del;
use get::Get;
use set::Set;

#[derive(Debug, PartialEq)]
pub enum Command {
    Get(Get),
    Set(Set),
    Del(Del),
    Config(Config),
}

impl Executable for Command {
    fn exec(self, store: &Store) -> Frame {
        match self {
            Command::Get(cmd) => cmd.exec(store),
            Command::Set(cmd) => cmd.exec(store),
            Command::Del(cmd) => cmd.exec(store),
            Command::Config(cmd) => cmd.exec(store),
        }
    }
}

impl TryFrom<Frame> for Command {
    type Error = CommandError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        // Clients send commands to the server as RESP arrays.
        let frames = match frame {
            Frame::Array(array) => array,
            frame => {
                return Err(CommandError::Parse(CommandParserError::InvalidFrame {
                    expected: "array".to_string(),
                    actual: frame,
                }))
            }
        };

        let parser = &mut CommandParser {
            parts: frames.into_iter(),
        };

        let command_name = match parser.parse_command_name() {
            Ok(name) => name,
            Err(CommandParserError::EndOfStream) => return Err(CommandError::Empty),
            Err(err) => return Err(err.into()),
        };

        match &command_name[..] {
            "get" => Get::try_from(parser).map(Command::Get),
            "set" => Set::try_from(parser).map(Command::Set),
            "del" => Del::try_from(parser).map(Command::Del),
            "config" => Config::try_from(parser).map(Command::Config),
            _ => Err(CommandError::Unknown(command_name)),
        }
    }
}

pub struct CommandParser {
    parts: vec::IntoIter<Frame>,
}

impl CommandParser {
    fn parse_command_name(&mut self) -> Result<String, CommandParserError> {
        let command_name = self.parts.next().ok_or(CommandParserError::EndOfStream)?;

        match command_name {
            Frame::Simple(s) => Ok(s.to_lowercase()),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_lowercase())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple string".to_string(),
                actual: frame,
            }),
        }
    }

    fn next_string(&mut self) -> Result<String, CommandParserError> {
        let frame = self.parts.next().ok_or(CommandParserError::EndOfStream)?;

        match frame {
            // Both `Simple` and `Bulk` representation may be strings. Strings are parsed to UTF-8.
            // While errors are stored as strings, they are considered separate types.
            Frame::Simple(s) => Ok(s),
            Frame::Bulk(bytes) => str::from_utf8(&bytes[..])
                .map(|s| s.to_string())
                .map_err(CommandParserError::InvalidUTF8String),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    fn next_bytes(&mut self) -> Result<Bytes, CommandParserError> {
        let frame = self.parts.next().ok_or(CommandParserError::EndOfStream)?;

        match frame {
            Frame::Simple(s) => Ok(Bytes::from(s)),
            Frame::Bulk(bytes) => Ok(bytes),
            frame => Err(CommandParserError::InvalidFrame {
                expected: "simple or bulk string".to_string(),
                actual: frame,
            }),
        }
    }

    /// Asserts every frame was consumed; commands take an exact argument
    /// count, so trailing frames are an arity error.
    fn finish(&mut self) -> Result<(), CommandParserError> {
        match self.parts.next() {
            Some(_) => Err(CommandParserError::TrailingFrames),
            None => Ok(()),
        }
    }
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandParserError {
    #[error("protocol error; invalid frame, expected {expected}, got {actual}")]
    InvalidFrame { expected: String, actual: Frame },
    #[error("protocol error; invalid UTF-8 string")]
    InvalidUTF8String(#[from] str::Utf8Error),
    #[error("protocol error; attempting to extract a value failed due to the frame being fully consumed")]
    EndOfStream,
    #[error("protocol error; command carries more arguments than it takes")]
    TrailingFrames,
}

#[derive(Debug, ThisError, PartialEq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command {0:?}")]
    Unknown(String),
    #[error("wrong number of arguments")]
    Arity,
    #[error(transparent)]
    Parse(CommandParserError),
}

impl From<CommandParserError> for CommandError {
    fn from(err: CommandParserError) -> CommandError {
        match err {
            CommandParserError::EndOfStream | CommandParserError::TrailingFrames => {
                CommandError::Arity
            }
            err => CommandError::Parse(err),
        }
    }
}

impl CommandError {
    /// The wire reply for a failed command. Per-request failures never
    /// close the connection; they are answered like any other request.
    pub fn to_reply(&self) -> Frame {
        let message = match self {
            CommandError::Empty => "ERR Empty command",
            CommandError::Unknown(_) | CommandError::Arity => "ERR Unknown command",
            CommandError::Parse(_) => "ERR Invalid Command",
        };
        Frame::Error(message.to_string())
    }
}
