#![forbid(unsafe_code)]
#[macro_use]
extern crate log;

use clap::{ArgGroup, Parser};
use merino::auth::{Authenticator, NoAuthAuthenticator, StaticCredentials, UserPassAuthenticator};
use merino::dialer::TokioDialer;
use merino::server::{Server, Tunables};
use std::env;
use std::error::Error;
use std::os::unix::prelude::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Logo printed when the server starts.
const LOGO: &str = r"
                      _
  _ __ ___   ___ _ __(_)_ __   ___
 | '_ ` _ \ / _ \ '__| | '_ \ / _ \
 | | | | | |  __/ |  | | | | | (_) |
 |_| |_| |_|\___|_|  |_|_| |_|\___/

 A SOCKS5 Proxy server written in Rust
";

#[derive(Parser, Debug)]
#[clap(version)]
#[clap(group(
    ArgGroup::new("auth")
        .required(true)
        .args(&["no-auth", "users"]),
))]
struct Opt {
    #[clap(short, long, default_value_t = 1080)]
    /// Set port to listen on
    port: u16,

    #[clap(short, long, default_value = "127.0.0.1")]
    /// Set ip to listen on
    ip: String,

    #[clap(long)]
    /// Allow insecure configuration
    allow_insecure: bool,

    #[clap(long)]
    /// Allow unauthenticated connections
    no_auth: bool,

    #[clap(short, long)]
    /// CSV file with username/password pairs
    users: Option<PathBuf>,

    /// UDP relay idle eviction threshold, in seconds
    #[clap(long, default_value_t = 10)]
    udp_timeout: u64,

    /// Grace period before a ref-count-zero BIND listener is closed, in seconds
    #[clap(long, default_value_t = 1)]
    listener_timeout: u64,

    /// Gate verbose per-session trace logging
    #[clap(long)]
    debug: bool,

    /// Log verbosity level. -vv for more verbosity.
    /// Environment variable `RUST_LOG` overrides this setting!
    #[clap(short, parse(from_occurrences))]
    verbosity: u8,

    /// Do not output any logs (even errors!). Overrides `RUST_LOG`
    #[clap(short)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("{}", LOGO);

    let opt = Opt::parse();

    let log_env = env::var("RUST_LOG");
    if log_env.is_err() {
        let level = match opt.verbosity {
            1 => "merino=DEBUG",
            2 => "merino=TRACE",
            _ => "merino=INFO",
        };
        env::set_var("RUST_LOG", level);
    }

    if !opt.quiet {
        pretty_env_logger::init_timed();
    }

    if log_env.is_ok() && (opt.verbosity != 0) {
        warn!(
            "Log level is overriden by environmental variable to `{}`",
            log_env.unwrap().as_str()
        );
    }

    let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::new();

    if opt.no_auth {
        authenticators.push(Arc::new(NoAuthAuthenticator));
    }

    if let Some(users_file) = &opt.users {
        let file = std::fs::File::open(users_file).unwrap_or_else(|e| {
            error!("Can't open file {:?}: {}", users_file, e);
            std::process::exit(1);
        });

        let metadata = file.metadata()?;
        // 7 is (S_IROTH | S_IWOTH | S_IXOTH), the "permissions for others" bits.
        if (metadata.mode() & 7) > 0 && !opt.allow_insecure {
            error!(
                "Permissions {:o} for {:?} are too open. \
                It is recommended that your users file is NOT accessible by others. \
                To override this check, set --allow-insecure",
                metadata.mode() & 0o777,
                users_file
            );
            std::process::exit(1);
        }

        let credentials = StaticCredentials::load_csv(users_file).unwrap_or_else(|e| {
            error!("{}", e);
            std::process::exit(1);
        });

        if credentials.is_empty() {
            error!("No users loaded from {:?}. Check configuration.", users_file);
            std::process::exit(1);
        }

        authenticators.push(Arc::new(UserPassAuthenticator {
            credentials: Arc::new(credentials) as Arc<dyn merino::auth::CredentialStore>,
        }));
    }

    let tunables = Tunables {
        udp_timeout: Duration::from_secs(opt.udp_timeout),
        listener_timeout: Duration::from_secs(opt.listener_timeout),
        debug: opt.debug,
        ..Tunables::default()
    };

    let server = Server::with_default_dialer(authenticators, Arc::new(TokioDialer), tunables);

    let listener = TcpListener::bind((opt.ip.as_str(), opt.port)).await?;
    info!("listening on {}:{}", opt.ip, opt.port);

    let (stop_tx, stop_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(true);
    })
    .expect("Error setting Ctrl-C handler");

    server.serve(listener, stop_rx).await;

    Ok(())
}
