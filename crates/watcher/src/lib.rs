#![deny(unsafe_code)]

//! Directory change watching.
//!
//! [`Watchdog`] wraps the platform file notification API (via the `notify`
//! crate) behind the blocking interface the client orchestrator wants: add
//! a subtree, call [`Watchdog::wait`], get back one event describing the
//! final observed state of one path.
//!
//! The interesting part is echo suppression. When the client itself writes
//! a file (applying a remote change), the kernel reports that write like
//! any other. The transfer worker brackets its writes with
//! [`Watchdog::disregard`] and [`Watchdog::regard`]: between the two, events
//! for that exact path are dropped; after `regard`, events whose mtime is
//! not newer than the regard stamp are dropped too, which catches the
//! notification that may still be in flight when the bracket closes. The
//! stamp is cleared the first time a genuinely newer event gets through.
//!
//! Unrelated duplicate events are not deduplicated here; the catalog
//! comparison downstream makes redundant work harmless.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use thiserror::Error;
use tracing::{trace, warn};

/// Watcher failures.
#[derive(Debug, Error)]
pub enum WatchError {
    /// The platform notification facility could not be initialized.
    #[error("failed to initialize file watching: {0}")]
    Init(notify::Error),

    /// A watch could not be added or removed.
    #[error("failed to watch {path}: {source}")]
    Watch {
        /// Path of the watch.
        path: String,
        /// Underlying notify error.
        source: notify::Error,
    },

    /// The watcher has been closed; no further events will arrive.
    #[error("watcher closed")]
    Closed,
}

/// What happened to the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    /// Created or modified; `modified`/`size` hold the observed state.
    Modified,
    /// Removed or renamed away; `modified` is the observation time.
    Deleted,
}

/// One observed filesystem change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    /// Full path of the affected file.
    pub path: PathBuf,
    /// Change kind.
    pub status: FileStatus,
    /// Modification stamp (seconds); observation time for deletions.
    pub modified: u64,
    /// Size after the change; 0 for deletions.
    pub size: u64,
    /// True when the path is a directory.
    pub directory: bool,
}

enum Signal {
    Fs(Result<Event, notify::Error>),
    Closed,
}

/// The per-path suppression state behind `disregard`/`regard`.
#[derive(Default)]
struct Suppress {
    hidden: HashSet<String>,
    threshold: HashMap<String, u64>,
}

impl Suppress {
    /// Decides whether an event for `path` stamped `modified` reaches the
    /// caller, consuming the threshold on the first event that does.
    fn admit(&mut self, path: &str, modified: u64) -> bool {
        if self.hidden.contains(path) {
            return false;
        }
        if let Some(&stamp) = self.threshold.get(path) {
            if modified <= stamp {
                return false;
            }
            self.threshold.remove(path);
        }
        true
    }
}

/// Blocking directory watcher with echo suppression.
pub struct Watchdog {
    inner: Mutex<RecommendedWatcher>,
    signals: Receiver<Signal>,
    sentinel: Sender<Signal>,
    pending: Mutex<VecDeque<WatchEvent>>,
    suppress: Mutex<Suppress>,
    closed: AtomicBool,
}

impl Watchdog {
    /// Starts the platform watcher. No paths are watched yet.
    pub fn new() -> Result<Self, WatchError> {
        let (tx, rx) = unbounded();
        let fs_tx = tx.clone();
        let inner = notify::recommended_watcher(move |res| {
            let _ = fs_tx.send(Signal::Fs(res));
        })
        .map_err(WatchError::Init)?;
        Ok(Self {
            inner: Mutex::new(inner),
            signals: rx,
            sentinel: tx,
            pending: Mutex::new(VecDeque::new()),
            suppress: Mutex::new(Suppress::default()),
            closed: AtomicBool::new(false),
        })
    }

    /// Watches `path`, optionally with its whole subtree.
    pub fn add_watch(&self, path: &Path, recursive: bool) -> Result<(), WatchError> {
        self.check_open()?;
        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        self.inner
            .lock()
            .expect("watcher poisoned")
            .watch(path, mode)
            .map_err(|source| WatchError::Watch {
                path: path.display().to_string(),
                source,
            })
    }

    /// Stops watching `path`.
    pub fn del_watch(&self, path: &Path) -> Result<(), WatchError> {
        self.check_open()?;
        self.inner
            .lock()
            .expect("watcher poisoned")
            .unwatch(path)
            .map_err(|source| WatchError::Watch {
                path: path.display().to_string(),
                source,
            })
    }

    /// Hides events for exactly `path` until the matching [`Watchdog::regard`].
    pub fn disregard(&self, path: &Path) {
        let key = path.display().to_string();
        self.suppress
            .lock()
            .expect("suppress set poisoned")
            .hidden
            .insert(key);
    }

    /// Ends the suppression bracket for `path`. One final stale event (any
    /// event stamped no later than now) will still be dropped.
    pub fn regard(&self, path: &Path) {
        let key = path.display().to_string();
        let mut suppress = self.suppress.lock().expect("suppress set poisoned");
        suppress.hidden.remove(&key);
        suppress.threshold.insert(key, unix_now());
    }

    /// Blocks until a deliverable event arrives.
    pub fn wait(&self) -> Result<WatchEvent, WatchError> {
        loop {
            self.check_open()?;

            let candidate = self.pending.lock().expect("pending queue poisoned").pop_front();
            let event = match candidate {
                Some(event) => event,
                None => {
                    match self.signals.recv().map_err(|_| WatchError::Closed)? {
                        Signal::Closed => return Err(WatchError::Closed),
                        Signal::Fs(Err(e)) => {
                            warn!(error = %e, "file notification error");
                            continue;
                        }
                        Signal::Fs(Ok(event)) => {
                            let mut pending =
                                self.pending.lock().expect("pending queue poisoned");
                            convert(&event, &mut pending);
                            continue;
                        }
                    }
                }
            };

            let key = event.path.display().to_string();
            let deliver = self
                .suppress
                .lock()
                .expect("suppress set poisoned")
                .admit(&key, event.modified);
            if deliver {
                trace!(path = %key, status = ?event.status, "change event");
                return Ok(event);
            }
            trace!(path = %key, "suppressed self-induced event");
        }
    }

    /// Shuts the watcher down, failing the blocked `wait` and every later
    /// call. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.sentinel.send(Signal::Closed);
        }
    }

    fn check_open(&self) -> Result<(), WatchError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WatchError::Closed);
        }
        Ok(())
    }
}

/// Seconds since the epoch, saturating at zero for skewed clocks.
fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Expands a raw notification into zero or more events, stat-ing surviving
/// paths for their final state. Paths that vanished between the
/// notification and the stat are dropped; a delete event will follow.
fn convert(event: &Event, out: &mut VecDeque<WatchEvent>) {
    match &event.kind {
        EventKind::Remove(_) => {
            for path in &event.paths {
                out.push_back(deleted(path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            for path in &event.paths {
                out.push_back(deleted(path));
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [from, to] = event.paths.as_slice() {
                out.push_back(deleted(from));
                if let Some(ev) = modified(to) {
                    out.push_back(ev);
                }
            }
        }
        EventKind::Create(_) | EventKind::Modify(_) => {
            for path in &event.paths {
                if let Some(ev) = modified(path) {
                    out.push_back(ev);
                }
            }
        }
        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
}

fn deleted(path: &Path) -> WatchEvent {
    WatchEvent {
        path: path.to_path_buf(),
        status: FileStatus::Deleted,
        modified: unix_now(),
        size: 0,
        directory: false,
    }
}

fn modified(path: &Path) -> Option<WatchEvent> {
    let meta = std::fs::metadata(path).ok()?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs());
    Some(WatchEvent {
        path: path.to_path_buf(),
        status: FileStatus::Modified,
        modified,
        size: meta.len(),
        directory: meta.is_dir(),
    })
}
