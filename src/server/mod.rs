//! Kiku's server functionality modules.

mod request;
mod statemach;
mod recovery;
mod external;
mod kvserver;

pub use request::{Request, RequestId, RequesterId, RequestIdentity};
pub use statemach::{Command, CommandResult};
pub use external::{ApiRequest, ApiReply};
pub use kvserver::{KvServer, ServerConfig};

pub(crate) use statemach::StateMachine;
pub(crate) use recovery::{LogRecord, RecoveryLog};
