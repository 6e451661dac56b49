//! Kiku's client functionality modules.

mod apistub;

pub use apistub::{ClientApiStub, fresh_request_id};
