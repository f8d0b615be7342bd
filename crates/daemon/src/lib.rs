#![deny(unsafe_code)]

//! The libsync storage server.
//!
//! One process serves every account: the accept loop hands each incoming
//! connection to a session thread, sessions attach to per-user
//! [`workspace`] state, and all catalog mutations are persisted before they
//! are acknowledged. See [`run`] for the `libsyncd` entry point and
//! [`Daemon::start`] for embedding the server (the integration tests do).

pub mod session;
pub mod users;
pub mod workspace;

use std::ffi::OsString;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use clap::{Arg, ArgAction, Command};
use thiserror::Error;
use tracing::{error, info, warn};

use config::{Config, ConfigError};
use transport::NetAcceptor;

use users::{AuthError, Users};
use workspace::WorkspaceTable;

/// Fatal and per-session server errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration file problems.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Log setup problems.
    #[error(transparent)]
    Log(#[from] logging::LogError),

    /// Authentication failures surfaced by the handshake.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Socket-level failures.
    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    /// The peer sent bytes that do not parse.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// Store-directory filesystem failures.
    #[error("store i/o failure: {0}")]
    Storage(io::Error),
}

impl From<io::Error> for DaemonError {
    fn from(e: io::Error) -> Self {
        Self::Storage(e)
    }
}

/// Everything the server needs to start.
#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Address to listen on.
    pub bind_host: String,
    /// Port to listen on.
    pub bind_port: u16,
    /// Directory holding `login.mtd`, the catalogs, and the file trees.
    pub store_dir: PathBuf,
    /// Whether unknown users may create accounts.
    pub open_registration: bool,
}

impl DaemonSettings {
    /// Extracts settings from a parsed configuration.
    pub fn from_config(conf: &Config) -> Result<Self, DaemonError> {
        let bind_host = conf.get_str("bind_host")?.to_owned();
        let bind_port = u16::try_from(conf.get_int("bind_port")?).map_err(|_| {
            ConfigError::BadValue {
                key: "bind_port".into(),
                wanted: "port number",
            }
        })?;
        let store_dir = PathBuf::from(conf.get_str("store_dir")?);
        let open_registration = !conf.exists("reg_closed") || conf.get_int("reg_closed")? == 0;
        Ok(Self {
            bind_host,
            bind_port,
            store_dir,
            open_registration,
        })
    }
}

/// A running server: listeners bound, accept loop live.
pub struct Daemon {
    addrs: Vec<SocketAddr>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl Daemon {
    /// Binds the listeners and spawns the accept loop. Session threads are
    /// detached; they outlive their connection only long enough to detach
    /// from their workspace.
    pub fn start(settings: DaemonSettings) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(&settings.store_dir).map_err(DaemonError::Storage)?;
        let users = Arc::new(Users::open(
            &settings.store_dir,
            settings.open_registration,
        )?);
        let table = Arc::new(WorkspaceTable::new(settings.store_dir.clone()));

        let acceptor = NetAcceptor::bind(&settings.bind_host, settings.bind_port)?;
        let addrs = acceptor.local_addrs().to_vec();
        info!(host = %settings.bind_host, port = settings.bind_port, "server listening");

        let accept_thread = thread::Builder::new()
            .name("accept-loop".into())
            .spawn(move || accept_loop(&acceptor, &users, &table))
            .expect("spawn accept loop");

        Ok(Self {
            addrs,
            accept_thread: Some(accept_thread),
        })
    }

    /// The bound listen addresses.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }

    /// Blocks until the accept loop ends, which it only does on listener
    /// failure.
    pub fn wait(mut self) {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(acceptor: &NetAcceptor, users: &Arc<Users>, table: &Arc<WorkspaceTable>) {
    let next_session = AtomicU64::new(0);
    loop {
        let net = match acceptor.accept() {
            Ok(net) => net,
            Err(e) => {
                error!(error = %e, "accept loop stopping");
                return;
            }
        };
        let session_id = next_session.fetch_add(1, Ordering::Relaxed);
        let users = Arc::clone(users);
        let table = Arc::clone(table);
        let spawned = thread::Builder::new()
            .name(format!("session-{session_id}"))
            .spawn(move || {
                if let Err(e) = session::serve(net, session_id, &users, &table) {
                    warn!(session_id, error = %e, "session ended with error");
                }
            });
        if let Err(e) = spawned {
            error!(error = %e, "could not spawn session thread");
        }
    }
}

/// `libsyncd` entry point: `-d` to daemonize, `-c <file>` for the config.
/// Returns the process exit code.
pub fn run(args: impl IntoIterator<Item = OsString>) -> i32 {
    let matches = Command::new("libsyncd")
        .about("libsync storage server")
        .arg(
            Arg::new("daemonize")
                .short('d')
                .action(ArgAction::SetTrue)
                .help("Detach from the terminal and run in the background"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .value_name("FILE")
                .default_value("server.conf")
                .help("Configuration file"),
        )
        .try_get_matches_from(args);
    let matches = match matches {
        Ok(m) => m,
        Err(e) => {
            let _ = e.print();
            return 1;
        }
    };
    let daemonize = matches.get_flag("daemonize");
    let conf_path = PathBuf::from(matches.get_one::<String>("config").expect("has default"));

    // Errors before the log exists go to stderr.
    let (settings, log_opts) = match load_settings(&conf_path, daemonize) {
        Ok(out) => out,
        Err(e) => {
            eprintln!("{e}");
            return 1;
        }
    };
    if let Err(e) = logging::init(&log_opts) {
        eprintln!("{e}");
        return 1;
    }

    let daemon = match Daemon::start(settings) {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "failed to start");
            return 1;
        }
    };

    if daemonize && let Err(e) = platform::daemonize() {
        error!(error = %e, "failed to daemonize");
        return 1;
    }

    daemon.wait();
    0
}

fn load_settings(
    conf_path: &std::path::Path,
    daemonize: bool,
) -> Result<(DaemonSettings, logging::LogOptions), DaemonError> {
    let conf = Config::from_file(conf_path)?;
    let settings = DaemonSettings::from_config(&conf)?;
    let log_opts = logging::LogOptions {
        level: if conf.exists("log_level") {
            conf.get_int("log_level")?
        } else {
            logging::DEFAULT_LEVEL
        },
        stdout: !daemonize,
        file: conf
            .exists("log_file")
            .then(|| conf.get_str("log_file"))
            .transpose()?
            .map(PathBuf::from),
    };
    Ok((settings, log_opts))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Config {
        let mut c = Config::new();
        c.parse(text).unwrap();
        c
    }

    #[test]
    fn settings_require_bind_and_store() {
        let conf = parse("bind_host=::\nbind_port=4222\nstore_dir=/srv/libsync\n");
        let s = DaemonSettings::from_config(&conf).unwrap();
        assert_eq!(s.bind_host, "::");
        assert_eq!(s.bind_port, 4222);
        assert_eq!(s.store_dir, PathBuf::from("/srv/libsync"));
        assert!(s.open_registration);

        for missing in [
            "bind_port=1\nstore_dir=/x\n",
            "bind_host=h\nstore_dir=/x\n",
            "bind_host=h\nbind_port=1\n",
        ] {
            assert!(DaemonSettings::from_config(&parse(missing)).is_err());
        }
    }

    #[test]
    fn registration_toggle() {
        let conf = parse("bind_host=h\nbind_port=1\nstore_dir=/x\nreg_closed=1\n");
        assert!(!DaemonSettings::from_config(&conf).unwrap().open_registration);
        let conf = parse("bind_host=h\nbind_port=1\nstore_dir=/x\nreg_closed=0\n");
        assert!(DaemonSettings::from_config(&conf).unwrap().open_registration);
    }

    #[test]
    fn out_of_range_port_is_rejected() {
        let conf = parse("bind_host=h\nbind_port=70000\nstore_dir=/x\n");
        assert!(DaemonSettings::from_config(&conf).is_err());
    }
}
