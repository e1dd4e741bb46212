use super::{ProtocolState, RaftNode, Waiter};
use crate::command::Command;
use crate::config::Consistency;
use crate::error::RaftError;
use crate::rpc::{ExecuteRequest, ExecuteResponse};
use crate::storage::{LogEntry, LogIndex, Storage};
use async_channel::Sender;
use log::debug;

enum Outcome {
    /// Answered from the local state machine.
    Read(ExecuteResponse),
    /// Answered once the entry at `index` has been applied.
    Proposed {
        index: LogIndex,
        response: ExecuteResponse,
    },
}

impl<S: Storage> RaftNode<S> {
    /// Appends `command` to the log at the current term and pushes it to the peers right
    /// away. Without peers the entry is committed and applied immediately.
    pub(super) fn propose(&mut self, command: Command) -> LogIndex {
        let term = self.storage.current_term();
        let index = self.storage.append_entry(LogEntry::new(term, &command));
        debug!(
            "[{}] Appended {:?} at index {} in term {}",
            self.id,
            command.to_string(),
            index,
            term
        );
        if self.peers.is_empty() {
            self.commit_index = index;
            self.apply_committed();
        } else {
            self.broadcast_append_entries();
        }
        index
    }

    pub(super) fn execute(
        &mut self,
        request: ExecuteRequest,
        reply: Sender<Result<ExecuteResponse, RaftError>>,
    ) {
        match self.run_command(request) {
            Ok(Outcome::Read(response)) => {
                let _ = reply.try_send(Ok(response));
            }
            Ok(Outcome::Proposed { index, response }) => {
                let applied = self.last_applied >= index;
                if applied || self.config.consistency == Consistency::Immediate {
                    let _ = reply.try_send(Ok(response));
                } else if self.state == ProtocolState::Leader {
                    self.waiters.push(Waiter {
                        index,
                        term: self.storage.current_term(),
                        response,
                        reply,
                    });
                } else {
                    let _ = reply.try_send(Err(self.not_leader()));
                }
            }
            Err(e) => {
                debug!("[{}] Rejecting client command: {}", self.id, e);
                let _ = reply.try_send(Err(e));
            }
        }
    }

    /// Whether `key` will hold a value once every entry already in the log is applied.
    fn key_exists(&self, key: &str) -> bool {
        let unapplied = (self.last_applied + 1) as usize;
        for entry in self.storage.entries().iter().skip(unapplied).rev() {
            match entry.command.parse::<Command>() {
                Ok(Command::Set { key: k, .. } | Command::Append { key: k, .. }) if k == key => {
                    return true
                }
                Ok(Command::Del { key: k }) if k == key => return false,
                _ => {}
            }
        }
        self.state_machine.get(key).is_some()
    }

    fn run_command(&mut self, request: ExecuteRequest) -> Result<Outcome, RaftError> {
        self.ensure_leader()?;
        let ExecuteRequest {
            command,
            key,
            value,
        } = request;
        if key.is_empty() || key.contains(':') {
            return Err(RaftError::InvalidCommand(format!(
                "invalid key {:?}: keys must be non-empty and may not contain ':'",
                key
            )));
        }
        let require_value = || {
            value
                .clone()
                .ok_or_else(|| RaftError::InvalidCommand(format!("{} requires a value", command)))
        };

        match command.as_str() {
            "set" => {
                let value = require_value()?;
                let index = self.propose(Command::Set { key, value });
                Ok(Outcome::Proposed {
                    index,
                    response: ExecuteResponse::text("OK"),
                })
            }
            "get" => {
                let value = self.state_machine.get(&key).unwrap_or_default();
                Ok(Outcome::Read(ExecuteResponse::text(value)))
            }
            "del" => {
                let previous = self.state_machine.get(&key).unwrap_or_default();
                let response = ExecuteResponse::text(format!("\"{}\"", previous));
                let index = self.propose(Command::Del { key });
                Ok(Outcome::Proposed { index, response })
            }
            "append" => {
                let value = require_value()?;
                if !self.key_exists(&key) {
                    self.propose(Command::Set {
                        key: key.clone(),
                        value: String::new(),
                    });
                }
                let index = self.propose(Command::Append { key, value });
                Ok(Outcome::Proposed {
                    index,
                    response: ExecuteResponse::text("OK"),
                })
            }
            "strlen" | "strln" => Ok(Outcome::Read(ExecuteResponse::length(
                self.state_machine.strlen(&key),
            ))),
            other => Err(RaftError::InvalidCommand(format!(
                "unknown command {:?}",
                other
            ))),
        }
    }
}
