//! Commands carried by log entries.
//!
//! On the wire a command is a colon-delimited string (`set:<key>:<value>`,
//! `config:joint:<a,b>|<a>`, ...). Values are not escaped: the string is split on the
//! first two colons only and the remainder is kept as the value, so values may contain
//! `:` but keys may not.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

const NO_OP: &str = "no-op";

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    Set { key: String, value: String },
    Del { key: String },
    Append { key: String, value: String },
    /// Enter the joint stage: `combined` is old ∪ new, `new` the intended final membership.
    ConfigJoint {
        combined: Vec<String>,
        new: Vec<String>,
    },
    ConfigNew { members: Vec<String> },
    NoOp,
}

#[derive(Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    #[error("unknown command {0:?}")]
    UnknownOpcode(String),
    #[error("missing {field} in command {command:?}")]
    Missing {
        field: &'static str,
        command: String,
    },
}

impl Command {
    pub fn is_config(&self) -> bool {
        matches!(self, Command::ConfigJoint { .. } | Command::ConfigNew { .. })
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == NO_OP {
            return Ok(Command::NoOp);
        }
        let unknown = || CommandError::UnknownOpcode(s.to_string());
        let missing = |field| CommandError::Missing {
            field,
            command: s.to_string(),
        };

        let (opcode, rest) = s.split_once(':').ok_or_else(unknown)?;
        match opcode {
            "set" => {
                let (key, value) = rest.split_once(':').ok_or_else(|| missing("value"))?;
                Ok(Command::Set {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            "append" => {
                let (key, value) = rest.split_once(':').ok_or_else(|| missing("value"))?;
                Ok(Command::Append {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
            "del" => Ok(Command::Del {
                key: rest.to_string(),
            }),
            "config" => match rest.split_once(':') {
                Some(("joint", members)) => {
                    let (combined, new) = members
                        .split_once('|')
                        .ok_or_else(|| missing("new configuration"))?;
                    Ok(Command::ConfigJoint {
                        combined: parse_members(combined),
                        new: parse_members(new),
                    })
                }
                Some(("new", members)) => Ok(Command::ConfigNew {
                    members: parse_members(members),
                }),
                _ => Err(unknown()),
            },
            _ => Err(unknown()),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Command::Set { key, value } => write!(f, "set:{}:{}", key, value),
            Command::Del { key } => write!(f, "del:{}", key),
            Command::Append { key, value } => write!(f, "append:{}:{}", key, value),
            Command::ConfigJoint { combined, new } => {
                write!(f, "config:joint:{}|{}", combined.join(","), new.join(","))
            }
            Command::ConfigNew { members } => write!(f, "config:new:{}", members.join(",")),
            Command::NoOp => f.write_str(NO_OP),
        }
    }
}

fn parse_members(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(String::from)
        .collect()
}
