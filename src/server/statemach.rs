//! Kiku server state machine module implementation.

use std::collections::HashMap;

use crate::paxos::ReplicaId;
use crate::server::{Request, RequestId, RequesterId};

use serde::{Deserialize, Serialize};

use tokio::sync::Mutex;

/// Command to the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum Command {
    /// Get the value of given key.
    Get { key: String },

    /// Put a new value into key.
    Put { key: String, value: String },
}

/// Command execution result returned by the state machine.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    /// `Some(value)` if key is found in state machine, else `None`.
    Get { value: Option<String> },

    /// `Some(old_value)` if key was in state machine, else `None`.
    /// `duplicate` is set if the requester had already had this or a later
    /// Put applied, in which case nothing changed.
    Put {
        old_value: Option<String>,
        duplicate: bool,
    },
}

/// State is a `HashMap` from `String` key -> `String` value, plus the
/// highest applied Put request ID of each requester. Request IDs increase
/// per requester, so this one entry per requester is enough to recognize
/// any re-delivered Put.
#[derive(Debug, Default)]
struct State {
    kv: HashMap<String, String>,
    applied: HashMap<RequesterId, RequestId>,
}

/// The local volatile state machine, which is simply an in-memory HashMap
/// guarded by its own lock.
pub struct StateMachine {
    /// My replica ID.
    me: ReplicaId,

    /// Key-value map and applied Put identities.
    state: Mutex<State>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates a new empty state machine.
    pub fn new(me: ReplicaId) -> Self {
        StateMachine {
            me,
            state: Mutex::new(State::default()),
        }
    }

    /// Applies a committed request. A Put not newer than the last one applied
    /// for its requester leaves the map untouched.
    pub async fn apply(&self, req: &Request) -> CommandResult {
        let mut state = self.state.lock().await;
        let result = Self::execute(&mut state, req);
        pf_trace!(self.me; "executed {:?} -> {:?}", req, result);
        result
    }

    /// Reads a key directly from local state, bypassing the log.
    #[cfg(test)]
    pub async fn peek(&self, key: &str) -> Option<String> {
        self.state.lock().await.kv.get(key).cloned()
    }

    /// Number of keys currently stored.
    pub async fn num_keys(&self) -> usize {
        self.state.lock().await.kv.len()
    }
}

// StateMachine execution implementation
impl StateMachine {
    /// Executes given request on the state machine state.
    fn execute(state: &mut State, req: &Request) -> CommandResult {
        match &req.cmd {
            Command::Get { key } => CommandResult::Get {
                value: state.kv.get(key).cloned(),
            },
            Command::Put { key, value } => {
                let fresh = state
                    .applied
                    .get(&req.requester)
                    .map_or(true, |&last| req.req_id > last);
                if fresh {
                    state.applied.insert(req.requester, req.req_id);
                    CommandResult::Put {
                        old_value: state.kv.insert(key.clone(), value.clone()),
                        duplicate: false,
                    }
                } else {
                    CommandResult::Put {
                        old_value: state.kv.get(key).cloned(),
                        duplicate: true,
                    }
                }
            }
        }
    }
}
