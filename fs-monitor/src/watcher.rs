//! Directory monitor implementation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MonitorConfig;
use crate::error::{Result, WatcherError};
use crate::event::{ChangeEvent, Record};
use crate::session::{Registration, Wait, WatchSession};

/// Receives one record per change, on the monitor's task, one at a time.
///
/// An error stops the monitor and is returned from [`FsMonitor::start`].
pub trait EventSink: Send {
    fn accept(&mut self, record: Record) -> anyhow::Result<()>;
}

impl<F> EventSink for F
where
    F: FnMut(Record) -> anyhow::Result<()> + Send,
{
    fn accept(&mut self, record: Record) -> anyhow::Result<()> {
        self(record)
    }
}

/// Lifecycle state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Constructed, `start` not called yet.
    Created,

    /// The run loop is active.
    Running,

    /// Stop was requested; the run loop has not exited yet.
    Stopping,

    /// The run loop exited. Terminal.
    Stopped,
}

#[derive(Debug, Default)]
struct Counters {
    sessions_opened: AtomicU64,
    sessions_closed: AtomicU64,
    sessions_invalidated: AtomicU64,
    registrations_failed: AtomicU64,
    events_emitted: AtomicU64,
    overflows: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Statistics about a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStats {
    /// Watch sessions opened.
    pub sessions_opened: u64,

    /// Watch sessions closed.
    pub sessions_closed: u64,

    /// Sessions torn down because a lease or the handle failed.
    pub sessions_invalidated: u64,

    /// Individual path registrations that failed.
    pub registrations_failed: u64,

    /// Records accepted by the sink.
    pub events_emitted: u64,

    /// Overflow notifications received.
    pub overflows: u64,
}

/// Why a session ended.
enum SessionEnd {
    Stopped,
    Invalidated(String),
}

/// An open session, counted as closed when dropped.
struct ActiveSession<'a> {
    session: WatchSession,
    counters: &'a Counters,
}

impl Drop for ActiveSession<'_> {
    fn drop(&mut self) {
        Counters::bump(&self.counters.sessions_closed);
    }
}

/// Sets the stop flag and fires the completion latch however `start` exits.
struct Completion<'a> {
    monitor: &'a FsMonitor,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        self.monitor.stop.cancel();
        let fired = self
            .monitor
            .done
            .send_if_modified(|done| !std::mem::replace(done, true));
        if fired {
            info!(id = %self.monitor.id, "Directory monitor stopped");
        }
    }
}

/// Watches a fixed set of directories and hands each change to a sink.
///
/// `start` runs the watch loop until [`stop`](Self::stop) is called, a
/// host-supplied shutdown token is cancelled, or the sink fails. `stop` and
/// [`await_stopped`](Self::await_stopped) may be called from any task.
pub struct FsMonitor {
    /// Host-assigned id. Not interpreted.
    id: String,

    config: MonitorConfig,

    /// One-way stop flag.
    stop: CancellationToken,

    /// Host shutdown token `stop` is derived from, if any.
    shutdown: Option<CancellationToken>,

    /// Whether `stop` itself was called.
    stop_requested: AtomicBool,

    started: AtomicBool,

    /// Completion latch.
    done: watch::Sender<bool>,

    counters: Counters,
}

impl FsMonitor {
    /// Create a monitor. Fails only on a structurally invalid path list.
    pub fn new(id: impl Into<String>, config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        let (done, _) = watch::channel(false);

        Ok(Self {
            id: id.into(),
            config,
            stop: CancellationToken::new(),
            shutdown: None,
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            done,
            counters: Counters::default(),
        })
    }

    /// Also stop when `shutdown` is cancelled.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.stop = shutdown.child_token();
        self.shutdown = Some(shutdown);
        self
    }

    /// Host-assigned id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configured directories, in registration order.
    pub fn paths(&self) -> &[PathBuf] {
        &self.config.paths
    }

    /// The monitor's configuration.
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Run the watch loop, delivering records to `sink` until stopped.
    ///
    /// May be called once. Returns `Ok(())` after a stop or host shutdown;
    /// sink failures and failures to open a watch handle are returned after
    /// the monitor has shut down.
    pub async fn start<S: EventSink>(&self, mut sink: S) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WatcherError::AlreadyStarted(self.id.clone()));
        }
        let _completion = Completion { monitor: self };

        if self.stop.is_cancelled() {
            debug!(id = %self.id, "Stop requested before start");
            return Ok(());
        }

        info!(
            id = %self.id,
            paths = self.config.paths.len(),
            "Directory monitor started"
        );
        self.run(&mut sink).await
    }

    /// Request a cooperative stop. Never blocks; safe to call repeatedly.
    pub fn stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            debug!(id = %self.id, "Stop requested");
        }
        self.stop.cancel();
    }

    /// Wait until the run loop has exited.
    ///
    /// Resolves immediately if it already has. If `start` is never called it
    /// never resolves.
    pub async fn await_stopped(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Whether the completion latch has fired.
    pub fn is_stopped(&self) -> bool {
        *self.done.borrow()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        if self.is_stopped() {
            MonitorState::Stopped
        } else if !self.started.load(Ordering::SeqCst) {
            MonitorState::Created
        } else if self.stop.is_cancelled() {
            MonitorState::Stopping
        } else {
            MonitorState::Running
        }
    }

    /// Snapshot of the monitor's counters.
    pub fn stats(&self) -> MonitorStats {
        let c = &self.counters;
        MonitorStats {
            sessions_opened: c.sessions_opened.load(Ordering::Relaxed),
            sessions_closed: c.sessions_closed.load(Ordering::Relaxed),
            sessions_invalidated: c.sessions_invalidated.load(Ordering::Relaxed),
            registrations_failed: c.registrations_failed.load(Ordering::Relaxed),
            events_emitted: c.events_emitted.load(Ordering::Relaxed),
            overflows: c.overflows.load(Ordering::Relaxed),
        }
    }

    async fn run<S: EventSink>(&self, sink: &mut S) -> Result<()> {
        while !self.stop.is_cancelled() {
            let mut active = self.open_session()?;

            let reason = match self.drive(&mut active.session, sink).await? {
                SessionEnd::Stopped => break,
                SessionEnd::Invalidated(reason) => reason,
            };
            Counters::bump(&self.counters.sessions_invalidated);
            drop(active);

            if self.stop.is_cancelled() {
                break;
            }
            warn!(id = %self.id, %reason, "Watch session invalidated, rebuilding");

            tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                _ = tokio::time::sleep(self.config.rebuild_backoff()) => {}
            }
        }

        if !self.stop_requested.load(Ordering::SeqCst)
            && self.shutdown.as_ref().is_some_and(CancellationToken::is_cancelled)
        {
            info!(id = %self.id, "Wait interrupted by host shutdown");
        }
        Ok(())
    }

    fn open_session(&self) -> Result<ActiveSession<'_>> {
        let mut session = WatchSession::open()?;

        for path in &self.config.paths {
            if let Registration::Failed(err) = session.register(path) {
                warn!(id = %self.id, "{err}");
                Counters::bump(&self.counters.registrations_failed);
            }
        }

        Counters::bump(&self.counters.sessions_opened);
        info!(
            id = %self.id,
            active = session.active_keys(),
            configured = self.config.paths.len(),
            "Watch session opened"
        );

        Ok(ActiveSession {
            session,
            counters: &self.counters,
        })
    }

    async fn drive<S: EventSink>(
        &self,
        session: &mut WatchSession,
        sink: &mut S,
    ) -> Result<SessionEnd> {
        let poll_interval = self.config.poll_interval();

        loop {
            if self.stop.is_cancelled() {
                return Ok(SessionEnd::Stopped);
            }

            let wait = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return Ok(SessionEnd::Stopped),
                wait = session.wait(poll_interval) => wait,
            };

            let pending = match wait {
                Wait::Batch(pending) => pending,
                Wait::Idle => continue,
                Wait::Closed => {
                    return Ok(SessionEnd::Invalidated(
                        "watch handle stopped delivering".to_string(),
                    ));
                }
            };

            let batch = session.translate(pending);
            if batch.overflows > 0 {
                warn!(id = %self.id, count = batch.overflows, "Notifications were dropped by the OS");
                self.counters
                    .overflows
                    .fetch_add(batch.overflows as u64, Ordering::Relaxed);
            }

            for event in &batch.events {
                self.emit(sink, event)?;
            }

            if let Some(reason) = batch.broken {
                return Ok(SessionEnd::Invalidated(reason));
            }
            if let Some(path) = session.renew(&batch.touched) {
                return Ok(SessionEnd::Invalidated(format!(
                    "lease lost for {}",
                    path.display()
                )));
            }
        }
    }

    fn emit<S: EventSink>(&self, sink: &mut S, event: &ChangeEvent) -> Result<()> {
        let record = event.to_record()?;
        debug!(
            id = %self.id,
            kind = %event.event_type,
            dir = %event.file_path,
            name = %event.file_name,
            "Emitting change"
        );

        sink.accept(record).map_err(|err| {
            error!(id = %self.id, "Sink rejected event: {err:#}");
            WatcherError::Sink(err)
        })?;
        Counters::bump(&self.counters.events_emitted);
        Ok(())
    }
}
