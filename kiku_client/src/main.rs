//! Kiku one-shot command-line client executable.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use tokio::runtime::Builder;

use kiku::{ClientApiStub, KikuError, RequesterId, logger_init, pf_error};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Client-facing API address of the server node to talk to.
    #[arg(short, long)]
    server: SocketAddr,

    /// Requester ID to issue requests as; random if not given.
    #[arg(short, long)]
    requester: Option<RequesterId>,

    #[command(subcommand)]
    op: Op,
}

/// Operation to perform.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Op {
    /// Put a value into key.
    Put { key: String, value: String },

    /// Get the value of key.
    Get { key: String },

    /// Show the server's next free instance ID.
    Size,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(KikuError)` on any error.
    fn sanitize(&self) -> Result<(), KikuError> {
        match &self.op {
            Op::Put { key, .. } | Op::Get { key } if key.is_empty() => {
                Err(KikuError::msg("key must not be empty"))
            }
            _ => Ok(()),
        }
    }
}

/// Actual main function of Kiku client.
fn client_main() -> Result<(), KikuError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let requester = args.requester.unwrap_or_else(rand::random);

    // a single request needs no more than a current-thread runtime
    let runtime = Builder::new_current_thread()
        .enable_all()
        .thread_name("tokio-worker-client")
        .build()?;

    runtime.block_on(async move {
        let mut stub = ClientApiStub::connect(requester, args.server).await?;
        match args.op {
            Op::Put { key, value } => {
                if stub.put(key, value).await? {
                    println!("OK");
                } else {
                    println!("FAILED");
                }
            }
            Op::Get { key } => match stub.get(key).await? {
                Some(value) => println!("{}", value),
                None => println!("(not found)"),
            },
            Op::Size => println!("{}", stub.storage_size().await?),
        }

        Ok::<(), KikuError>(()) // give type hint for this async closure
    })
}

/// Main function of Kiku client.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = client_main() {
        pf_error!("c"; "client_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    #[test]
    fn parse_put() {
        let args = CliArgs::parse_from([
            "kiku_client",
            "--server",
            "127.0.0.1:52700",
            "put",
            "k",
            "v",
        ]);
        assert_eq!(
            args.op,
            Op::Put {
                key: "k".into(),
                value: "v".into()
            }
        );
        assert_eq!(args.requester, None);
        assert_eq!(args.sanitize(), Ok(()));
    }

    #[test]
    fn parse_get_with_requester() {
        let args = CliArgs::parse_from([
            "kiku_client",
            "-s",
            "127.0.0.1:52700",
            "-r",
            "42",
            "get",
            "k",
        ]);
        assert_eq!(args.op, Op::Get { key: "k".into() });
        assert_eq!(args.requester, Some(42));
    }

    #[test]
    fn sanitize_empty_key() {
        let args = CliArgs::parse_from([
            "kiku_client",
            "-s",
            "127.0.0.1:52700",
            "get",
            "",
        ]);
        assert!(args.sanitize().is_err());
    }
}
