//! Kiku server node executable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;

use log::{self, LevelFilter};

use tokio::runtime::Builder;
use tokio::sync::watch;

use kiku::{KikuError, KvServer, ReplicaId, logger_init, pf_error, pf_warn};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My index into the peer lists.
    #[arg(short, long)]
    me: ReplicaId,

    /// Client-facing API addresses of all server nodes, comma-separated,
    /// in replica ID order.
    #[arg(short, long, value_delimiter = ',', required = true)]
    api_peers: Vec<SocketAddr>,

    /// Peer-peer addresses of all server nodes, comma-separated, in replica
    /// ID order.
    #[arg(short, long, value_delimiter = ',', required = true)]
    p2p_peers: Vec<SocketAddr>,

    /// Server configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    config: String,

    /// Paxos configuration TOML string.
    /// Every '+' is treated as newline.
    #[arg(long, default_value_t = String::from(""))]
    paxos_config: String,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(KikuError)` on any error.
    fn sanitize(&self) -> Result<(), KikuError> {
        if self.api_peers.len() != self.p2p_peers.len() {
            return Err(KikuError::msg(format!(
                "api_peers and p2p_peers length mismatch: {} != {}",
                self.api_peers.len(),
                self.p2p_peers.len()
            )));
        }
        if self.api_peers.is_empty()
            || self.api_peers.len() > ReplicaId::MAX as usize
        {
            return Err(KikuError::msg(format!(
                "invalid population {}",
                self.api_peers.len()
            )));
        }
        if self.me as usize >= self.api_peers.len() {
            return Err(KikuError::msg(format!(
                "invalid replica ID {} / {}",
                self.me,
                self.api_peers.len()
            )));
        }
        if self.threads < 2 {
            return Err(KikuError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        // check for duplicate addresses
        let mut addr_set = HashSet::new();
        for addr in self.api_peers.iter().chain(self.p2p_peers.iter()) {
            if !addr_set.insert(addr) {
                return Err(KikuError::msg(format!(
                    "duplicate address {} given",
                    addr
                )));
            }
        }
        Ok(())
    }
}

/// Actual main function of Kiku server node.
fn server_main() -> Result<(), KikuError> {
    // read in and parse command line arguments
    let mut args = CliArgs::parse();
    args.sanitize()?;

    // parse optional config strings if given
    let config_str = if args.config.is_empty() {
        None
    } else {
        args.config = args.config.replace('+', "\n");
        Some(args.config.clone())
    };
    let paxos_config_str = if args.paxos_config.is_empty() {
        None
    } else {
        args.paxos_config = args.paxos_config.replace('+', "\n");
        Some(args.paxos_config.clone())
    };

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("s"; "error sending to term channel: {}", e);
        }
    })?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-server")
            .build()?;

        // enter tokio runtime, set up the server node, and serve until
        // terminated
        runtime.block_on(async move {
            let server = KvServer::new_and_setup(
                args.me,
                args.api_peers,
                args.p2p_peers,
                config_str.as_deref(),
                paxos_config_str.as_deref(),
            )
            .await?;

            rx_term.changed().await.map_err(|e| KikuError::msg(e.to_string()))?;
            pf_warn!(args.me; "termination signal received");
            server.close().await;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), KikuError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of Kiku server node.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = server_main() {
        pf_error!("s"; "server_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn addrs(base_port: u16, n: u16) -> Vec<SocketAddr> {
        (0..n)
            .map(|i| SocketAddr::from(([127, 0, 0, 1], base_port + i)))
            .collect()
    }

    fn valid_args() -> CliArgs {
        CliArgs {
            me: 1,
            api_peers: addrs(52700, 3),
            p2p_peers: addrs(52800, 3),
            config: "".into(),
            paxos_config: "".into(),
            threads: 4,
        }
    }

    #[test]
    fn sanitize_valid() {
        assert_eq!(valid_args().sanitize(), Ok(()));
    }

    #[test]
    fn sanitize_length_mismatch() {
        let mut args = valid_args();
        args.p2p_peers.pop();
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_me() {
        let mut args = valid_args();
        args.me = 3;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_threads() {
        let mut args = valid_args();
        args.threads = 1;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_duplicate_addr() {
        let mut args = valid_args();
        args.p2p_peers[2] = args.api_peers[0];
        assert_eq!(
            args.sanitize(),
            Err(KikuError::msg("duplicate address 127.0.0.1:52700 given"))
        );
    }

    #[test]
    fn parse_peer_lists() {
        let args = CliArgs::parse_from([
            "kiku_server",
            "--me",
            "0",
            "--api-peers",
            "127.0.0.1:52700,127.0.0.1:52701",
            "--p2p-peers",
            "127.0.0.1:52800,127.0.0.1:52801",
        ]);
        assert_eq!(args.api_peers.len(), 2);
        assert_eq!(args.p2p_peers[1], "127.0.0.1:52801".parse().unwrap());
        assert_eq!(args.sanitize(), Ok(()));
    }
}
