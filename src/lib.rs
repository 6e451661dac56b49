//! Public interface to the Kiku core library, linked by the server and client
//! executables.

#[macro_use]
mod utils;

mod paxos;
mod server;
mod client;

#[doc(inline)]
pub use crate::utils::{KikuError, logger_init};

#[doc(inline)]
pub use crate::paxos::{
    Ballot, FaultyTransport, InstanceId, PaxosConfig, PaxosPeer, PaxosValue,
    PeerMsg, PeerReply, PeerTransport, ReplicaId, TcpTransport,
};

#[doc(inline)]
pub use crate::server::{
    ApiReply, ApiRequest, Command, CommandResult, KvServer, Request,
    RequestId, RequestIdentity, RequesterId, ServerConfig,
};

#[doc(inline)]
pub use crate::client::{ClientApiStub, fresh_request_id};
