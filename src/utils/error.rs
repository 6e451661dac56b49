//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for Kiku.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KikuError(pub(crate) String);

impl KikuError {
    pub fn msg(msg: impl ToString) -> Self {
        KikuError(msg.to_string())
    }
}

impl fmt::Display for KikuError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for KikuError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `KikuError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for KikuError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                KikuError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::time::error::Elapsed);
impl_from_error!(tokio::task::JoinError);
impl_from_error!(ctrlc::Error);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = KikuError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = KikuError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }

    #[test]
    fn from_parse_error() {
        let e: KikuError = "x7".parse::<u64>().unwrap_err().into();
        assert!(e.0.contains("invalid digit"));
    }
}
