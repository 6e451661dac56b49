//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;
mod rpcserver;

pub use error::KikuError;
pub use print::logger_init;
pub use rpcserver::{RpcHandler, RpcServer};

pub(crate) use safetcp::{
    read_frame, write_frame, tcp_bind_with_retry, tcp_connect_with_retry,
};
