#![deny(unsafe_code)]

//! The libsync mirroring client.
//!
//! One [`Client`] keeps a local directory and the server's copy of it
//! convergent. Three workers cooperate over a shared event queue:
//!
//! - the **watch worker** drains the directory watcher and queues local
//!   changes,
//! - the **pull worker** drains server broadcasts and queues remote
//!   changes,
//! - the **transfer worker** drains the queue and moves bytes, bracketing
//!   its own writes with the watcher's suppression so applied remote
//!   changes do not bounce back to the server.
//!
//! On startup the client reconciles: it fetches the server catalog, scans
//! the sync directory, and queues the difference (local-newer pushes first,
//! then remote-newer pulls) before the workers begin draining normally.

mod connector;

pub use connector::{Connector, PushOutcome};

use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use clap::{Arg, ArgAction, Command};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use catalog::{Catalog, FileRecord};
use config::{Config, ConfigError};
use filetime::FileTime;
use watcher::{FileStatus, Watchdog};

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Configuration file problems.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Log setup problems.
    #[error(transparent)]
    Log(#[from] logging::LogError),

    /// The server announced a protocol version we do not speak.
    #[error("incompatible server version {version}")]
    IncompatibleServer {
        /// The version byte the server sent.
        version: u8,
    },

    /// The server rejected the credentials.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The server does not accept new accounts.
    #[error("registration is closed on this server")]
    RegistrationClosed,

    /// Socket-level failures.
    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    /// The server sent bytes that do not parse.
    #[error(transparent)]
    Protocol(#[from] protocol::ProtocolError),

    /// A catalog blob or directory scan failed.
    #[error(transparent)]
    Catalog(#[from] catalog::CatalogError),

    /// Payload sealing or opening failed.
    #[error(transparent)]
    Crypto(#[from] crypto::CryptoError),

    /// The directory watcher failed.
    #[error(transparent)]
    Watch(#[from] watcher::WatchError),

    /// Local file I/O failed.
    #[error("file i/o failure: {0}")]
    FileIo(io::Error),

    /// The server refused to store a push it had accepted.
    #[error("server refused pushed file {path}")]
    PushRefused {
        /// Catalog path of the file.
        path: String,
    },

    /// The server could not supply a requested file.
    #[error("server could not supply {path}")]
    PullRefused {
        /// Catalog path of the file.
        path: String,
    },

    /// The server refused a deletion.
    #[error("server refused deletion of {path}")]
    DeleteRefused {
        /// Catalog path of the file.
        path: String,
    },
}

/// Everything the client needs to start.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Server hostname.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Account name.
    pub user: String,
    /// Account password.
    pub pass: String,
    /// Directory to mirror.
    pub sync_dir: PathBuf,
    /// Optional shared secret enabling payload encryption.
    pub secret: Option<String>,
}

impl ClientSettings {
    /// Extracts settings from a parsed configuration.
    pub fn from_config(conf: &Config) -> Result<Self, ClientError> {
        if conf.exists("conn") && conf.get_str("conn")? != "sock" {
            return Err(ConfigError::BadValue {
                key: "conn".into(),
                wanted: "connector type",
            }
            .into());
        }
        let port = u16::try_from(conf.get_int("conn_port")?).map_err(|_| {
            ConfigError::BadValue {
                key: "conn_port".into(),
                wanted: "port number",
            }
        })?;
        Ok(Self {
            host: conf.get_str("conn_host")?.to_owned(),
            port,
            user: conf.get_str("conn_user")?.to_owned(),
            pass: conf.get_str("conn_pass")?.to_owned(),
            sync_dir: PathBuf::from(conf.get_str("sync_dir")?),
            secret: conf
                .exists("conn_key")
                .then(|| conf.get_str("conn_key"))
                .transpose()?
                .map(str::to_owned),
        })
    }
}

/// One queued unit of work for the transfer worker.
#[derive(Debug, Clone)]
struct SyncEvent {
    /// True when the remote copy is authoritative (pull or local delete).
    remote: bool,
    /// Catalog path.
    path: String,
    /// The winning record.
    record: FileRecord,
}

struct Queue {
    events: Mutex<VecDeque<SyncEvent>>,
    ready: Condvar,
}

impl Queue {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    fn push(&self, event: SyncEvent) {
        self.events
            .lock()
            .expect("event queue poisoned")
            .push_back(event);
        self.ready.notify_all();
    }

    /// Blocks for the next event; `None` once `done` is raised.
    fn pop(&self, done: &AtomicBool) -> Option<SyncEvent> {
        let mut events = self.events.lock().expect("event queue poisoned");
        loop {
            if done.load(Ordering::Acquire) {
                return None;
            }
            if let Some(event) = events.pop_front() {
                return Some(event);
            }
            events = self.ready.wait(events).expect("event queue poisoned");
        }
    }

    fn wake(&self) {
        self.ready.notify_all();
    }
}

struct ClientShared {
    sync_dir: PathBuf,
    connector: Connector,
    watchdog: Watchdog,
    queue: Queue,
    done: AtomicBool,
}

/// A running client.
pub struct Client {
    shared: Arc<ClientShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Client {
    /// Connects, reconciles, and starts the workers.
    pub fn start(settings: &ClientSettings) -> Result<Self, ClientError> {
        let watchdog = Watchdog::new()?;
        watchdog.add_watch(&settings.sync_dir, true)?;

        let connector = Connector::connect(
            &settings.host,
            settings.port,
            &settings.user,
            &settings.pass,
            settings.secret.as_deref(),
        )?;

        let shared = Arc::new(ClientShared {
            sync_dir: settings.sync_dir.clone(),
            connector,
            watchdog,
            queue: Queue::new(),
            done: AtomicBool::new(false),
        });

        // Startup reconciliation: queue the catalog difference before the
        // workers start draining.
        let remote = shared.connector.fetch_catalog()?;
        let local = Catalog::scan(&shared.sync_dir)?;
        let merged = Catalog::merge(&local, &remote);
        info!(
            local = local.len(),
            remote = remote.len(),
            actions = merged.len(),
            "startup reconciliation"
        );
        for event in merged {
            shared.queue.push(SyncEvent {
                remote: event.remote,
                path: event.path,
                record: event.record,
            });
        }

        let mut workers = Vec::new();
        for (name, work) in [
            ("watch-worker", watch_worker as fn(&ClientShared)),
            ("pull-worker", pull_worker as fn(&ClientShared)),
            ("transfer-worker", transfer_worker as fn(&ClientShared)),
        ] {
            let shared = Arc::clone(&shared);
            workers.push(
                thread::Builder::new()
                    .name(name.into())
                    .spawn(move || work(&shared))
                    .expect("spawn client worker"),
            );
        }

        info!("client started");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Stops the workers: closes the transport and the watcher so blocked
    /// waits fail, then wakes the transfer worker. Idempotent.
    pub fn close(&self) {
        if self.shared.done.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.connector.close();
        self.shared.watchdog.close();
        self.shared.queue.wake();
    }

    /// Blocks until every worker has exited. Workers only exit after
    /// [`Client::close`] or a connection failure.
    pub fn wait(&self) {
        let mut workers = self.workers.lock().expect("worker list poisoned");
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
        self.wait();
    }
}

/// Drains the watcher into the queue as local (`remote = false`) events.
fn watch_worker(shared: &ClientShared) {
    loop {
        let event = match shared.watchdog.wait() {
            Ok(event) => event,
            Err(_) => {
                debug!("watch worker stopping");
                return;
            }
        };
        if event.directory {
            continue;
        }
        let Some(path) = catalog_path(&shared.sync_dir, &event.path) else {
            continue;
        };
        shared.queue.push(SyncEvent {
            remote: false,
            path,
            record: FileRecord {
                modified: event.modified,
                size: event.size,
                deleted: event.status == FileStatus::Deleted,
            },
        });
    }
}

/// Drains server broadcasts into the queue as remote events.
fn pull_worker(shared: &ClientShared) {
    loop {
        let event = match shared.connector.wait_event() {
            Ok(event) => event,
            Err(_) => {
                debug!("pull worker stopping");
                return;
            }
        };
        shared.queue.push(SyncEvent {
            remote: true,
            path: event.path,
            record: FileRecord {
                modified: event.modified,
                size: 0,
                deleted: event.deleted,
            },
        });
    }
}

/// Applies queued events until shutdown. Failures on individual events are
/// logged and dropped; the next change to the same file retries naturally.
fn transfer_worker(shared: &ClientShared) {
    while let Some(event) = shared.queue.pop(&shared.done) {
        let full = local_path(&shared.sync_dir, &event.path);

        shared.watchdog.disregard(&full);
        let result = if event.remote {
            apply_remote(shared, &event, &full)
        } else {
            apply_local(shared, &event, &full)
        };
        shared.watchdog.regard(&full);

        if let Err(e) = result {
            warn!(path = %event.path, error = %e, "sync action failed");
        }
    }
    debug!("transfer worker stopping");
}

/// Applies a change the server is authoritative for.
fn apply_remote(
    shared: &ClientShared,
    event: &SyncEvent,
    full: &Path,
) -> Result<(), ClientError> {
    if event.record.deleted {
        match fs::remove_file(full) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(ClientError::FileIo(e)),
        }
        prune_empty_parents(&shared.sync_dir, full);
        info!(path = %event.path, "applied remote delete");
        return Ok(());
    }

    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent).map_err(ClientError::FileIo)?;
    }
    let modified = shared.connector.pull_file(&event.path, full)?;
    filetime::set_file_mtime(full, FileTime::from_unix_time(modified as i64, 0))
        .map_err(ClientError::FileIo)?;
    info!(path = %event.path, modified, "applied remote change");
    Ok(())
}

/// Publishes a change the local tree is authoritative for.
fn apply_local(
    shared: &ClientShared,
    event: &SyncEvent,
    full: &Path,
) -> Result<(), ClientError> {
    if event.record.deleted {
        shared
            .connector
            .delete_file(&event.path, event.record.modified)?;
        info!(path = %event.path, "published local delete");
        return Ok(());
    }

    // Stat at transfer time: the watcher event may be stale by now.
    let meta = match fs::metadata(full) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %event.path, "file vanished before push");
            return Ok(());
        }
        Err(e) => return Err(ClientError::FileIo(e)),
    };
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    let file = fs::File::open(full).map_err(ClientError::FileIo)?;

    match shared
        .connector
        .push_file(&event.path, modified, file, meta.len())?
    {
        PushOutcome::Stored => info!(path = %event.path, modified, "published local change"),
        PushOutcome::Stale => {}
    }
    Ok(())
}

/// Converts a watcher path (absolute, under the sync dir) into a catalog
/// path with a leading slash.
fn catalog_path(sync_dir: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(sync_dir).ok()?;
    let rel = rel.to_str()?;
    if rel.is_empty() {
        return None;
    }
    Some(format!("/{rel}"))
}

/// Maps a catalog path back under the sync dir.
fn local_path(sync_dir: &Path, path: &str) -> PathBuf {
    sync_dir.join(path.trim_start_matches('/'))
}

/// Removes directories left empty by a remote delete, stopping at the sync
/// root.
fn prune_empty_parents(sync_dir: &Path, full: &Path) {
    let mut dir = full.parent();
    while let Some(d) = dir {
        if d == sync_dir || !d.starts_with(sync_dir) {
            break;
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        dir = d.parent();
    }
}

/// `libsync` entry point: `-d` to daemonize, `-c <file>` for the config.
/// Returns the process exit code.
pub fn run(args: impl IntoIterator<Item = OsString>) -> i32 {
    let matches = Command::new("libsync")
        .about("libsync mirroring client")
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
                .default_value("client.conf")
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

    let client = match Client::start(&settings) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to start");
            return 1;
        }
    };

    if daemonize && let Err(e) = platform::daemonize() {
        error!(error = %e, "failed to daemonize");
        return 1;
    }

    client.wait();
    0
}

fn load_settings(
    conf_path: &Path,
    daemonize: bool,
) -> Result<(ClientSettings, logging::LogOptions), ClientError> {
    let conf = Config::from_file(conf_path)?;
    let settings = ClientSettings::from_config(&conf)?;
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
