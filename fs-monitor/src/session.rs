//! A single watch session: one native watch handle plus its leases.
//!
//! Each registered directory holds a [`WatchKey`]. After a batch of
//! notifications touching a directory has been delivered, its lease must be
//! renewed; a lease that cannot be renewed terminates the session.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{Result, WatcherError};
use crate::event::{ChangeEvent, ChangeKind, RawChange, classify};

#[cfg(unix)]
type DirIdentity = (u64, u64);

#[cfg(not(unix))]
type DirIdentity = ();

/// Identity of the directory at `path`, or `None` if it is not a directory.
#[cfg(unix)]
fn dir_identity(path: &Path) -> Option<DirIdentity> {
    use std::os::unix::fs::MetadataExt;

    std::fs::metadata(path)
        .ok()
        .filter(std::fs::Metadata::is_dir)
        .map(|m| (m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn dir_identity(path: &Path) -> Option<DirIdentity> {
    std::fs::metadata(path)
        .ok()
        .filter(std::fs::Metadata::is_dir)
        .map(|_| ())
}

/// Subscription lease for one registered directory.
#[derive(Debug)]
pub(crate) struct WatchKey {
    /// Directory as configured; reported as `filePath`.
    path: PathBuf,

    /// Spellings notify may use for the same directory.
    aliases: Vec<PathBuf>,

    /// Directory the lease was taken on.
    identity: DirIdentity,

    /// Whether the lease is still held.
    valid: bool,
}

impl WatchKey {
    fn new(path: &Path, identity: DirIdentity) -> Self {
        let mut aliases = vec![path.to_path_buf()];
        if let Ok(absolute) = std::path::absolute(path) {
            aliases.push(absolute);
        }
        if let Ok(canonical) = std::fs::canonicalize(path) {
            aliases.push(canonical);
        }
        aliases.dedup();

        Self {
            path: path.to_path_buf(),
            aliases,
            identity,
            valid: true,
        }
    }

    /// Directory as configured.
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.valid
    }

    fn is(&self, dir: &Path) -> bool {
        self.aliases.iter().any(|alias| alias == dir)
    }

    /// Renew the lease. Fails once the directory is gone or replaced.
    pub(crate) fn renew(&mut self) -> bool {
        self.valid = self.valid && dir_identity(&self.path) == Some(self.identity);
        self.valid
    }
}

/// Outcome of registering a single directory.
#[derive(Debug)]
pub(crate) enum Registration {
    /// The directory is watched.
    Active,

    /// The directory could not be watched; other registrations are unaffected.
    Failed(WatcherError),
}

/// Result of waiting for notifications.
#[derive(Debug)]
pub(crate) enum Wait {
    /// At least one notification, in arrival order.
    Batch(Vec<notify::Result<notify::Event>>),

    /// Nothing arrived within the poll interval.
    Idle,

    /// The handle stopped delivering.
    Closed,
}

/// A translated batch.
#[derive(Debug, Default)]
pub(crate) struct Batch {
    /// Events to deliver, in OS order.
    pub(crate) events: Vec<ChangeEvent>,

    /// Indices of the keys whose leases must be renewed, in first-touch order.
    pub(crate) touched: Vec<usize>,

    /// Set when a notification signalled the whole handle is broken.
    pub(crate) broken: Option<String>,

    /// Number of overflow notifications in the batch.
    pub(crate) overflows: usize,
}

impl Batch {
    fn touch(&mut self, index: usize) {
        if !self.touched.contains(&index) {
            self.touched.push(index);
        }
    }
}

/// An open watch handle plus the leases registered against it.
pub(crate) struct WatchSession {
    watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    keys: Vec<WatchKey>,

    /// A watched directory that is also an entry of another watched directory
    /// is reported twice per change, once by each watch. Holds the change
    /// already emitted until its second copy arrives.
    echo: Option<(PathBuf, ChangeKind)>,
}

impl WatchSession {
    /// Open a new watch handle with no registrations.
    pub(crate) fn open() -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();

        let watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                // The receiver is gone once the session closes; late events are moot.
                let _ = tx.send(res);
            },
        )?;

        Ok(Self {
            watcher,
            rx,
            keys: Vec::new(),
            echo: None,
        })
    }

    /// Register `path` non-recursively.
    pub(crate) fn register(&mut self, path: &Path) -> Registration {
        let Some(identity) = dir_identity(path) else {
            let source = if path.exists() {
                notify::Error::generic("not a directory")
            } else {
                notify::Error::path_not_found()
            };
            return Registration::Failed(WatcherError::Registration {
                path: path.to_path_buf(),
                source: source.add_path(path.to_path_buf()),
            });
        };

        match self.watcher.watch(path, RecursiveMode::NonRecursive) {
            Ok(()) => {
                debug!("Registered {}", path.display());
                self.keys.push(WatchKey::new(path, identity));
                Registration::Active
            }
            Err(source) => Registration::Failed(WatcherError::Registration {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Number of live leases.
    pub(crate) fn active_keys(&self) -> usize {
        self.keys.iter().filter(|k| k.is_valid()).count()
    }

    /// Wait up to `timeout` for notifications, then drain whatever else is
    /// already pending.
    pub(crate) async fn wait(&mut self, timeout: Duration) -> Wait {
        let first = match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(first)) => first,
            Ok(None) => return Wait::Closed,
            Err(_elapsed) => return Wait::Idle,
        };

        let mut pending = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            pending.push(next);
        }
        Wait::Batch(pending)
    }

    /// Translate raw notifications into change events.
    pub(crate) fn translate(&mut self, pending: Vec<notify::Result<notify::Event>>) -> Batch {
        let mut batch = Batch::default();

        for res in pending {
            match res {
                Ok(event) => {
                    for change in classify(&event) {
                        self.translate_change(change, &mut batch);
                    }
                }
                Err(err) => self.translate_error(err, &mut batch),
            }
        }

        batch
    }

    fn translate_change(&mut self, change: RawChange, batch: &mut Batch) {
        match change {
            RawChange::Overflow => {
                batch.overflows += 1;
                for (index, key) in self.keys.iter().enumerate() {
                    if key.is_valid() {
                        batch.events.push(ChangeEvent::overflow(key.path()));
                        batch.touch(index);
                    }
                }
            }
            RawChange::Entry { path, kind } => {
                // The watched directory itself changed: renew its lease after the batch.
                let own = self.key_for_dir(&path);
                if let Some(index) = own {
                    batch.touch(index);
                }

                let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
                    debug!("Dropping notification without an entry name: {}", path.display());
                    return;
                };

                let Some(index) = self.key_for_dir(parent).filter(|&i| Some(i) != own) else {
                    if own.is_none() {
                        debug!("Dropping notification outside watched dirs: {}", path.display());
                    }
                    return;
                };

                if own.is_some() {
                    let change = (path.clone(), kind);
                    if self.echo.as_ref() == Some(&change) {
                        self.echo = None;
                        return;
                    }
                    self.echo = Some(change);
                }

                batch
                    .events
                    .push(ChangeEvent::new(self.keys[index].path(), name, kind));
                batch.touch(index);
            }
        }
    }

    fn translate_error(&self, err: notify::Error, batch: &mut Batch) {
        warn!("Watch error: {err}");

        let mut attributed = false;
        for path in &err.paths {
            let index = self
                .key_for_dir(path)
                .or_else(|| path.parent().and_then(|p| self.key_for_dir(p)));
            if let Some(index) = index {
                batch.touch(index);
                attributed = true;
            }
        }

        if !attributed {
            batch.broken = Some(err.to_string());
        }
    }

    fn key_for_dir(&self, dir: &Path) -> Option<usize> {
        self.keys.iter().position(|k| k.is_valid() && k.is(dir))
    }

    /// Renew the lease of every touched key. Returns the first key that could
    /// not be renewed.
    pub(crate) fn renew(&mut self, touched: &[usize]) -> Option<PathBuf> {
        let mut lost = None;
        for &index in touched {
            if let Some(key) = self.keys.get_mut(index) {
                if !key.renew() && lost.is_none() {
                    lost = Some(key.path().to_path_buf());
                }
            }
        }
        lost
    }
}

impl Drop for WatchSession {
    fn drop(&mut self) {
        debug!("Closed watch session ({} registrations)", self.keys.len());
    }
}
