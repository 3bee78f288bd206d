//! # FS Monitor
//!
//! Watches a fixed set of directories (non-recursively) and emits one
//! normalized change record per filesystem notification until stopped.
//!
//! ## Features
//!
//! - **Normalized Events**: `CREATE`, `MODIFY`, `DELETE` and `OVERFLOW`
//! - **Stable File Ids**: derived from directory and entry name
//! - **Self-healing Sessions**: a lost subscription rebuilds the session
//! - **Responsive Shutdown**: `stop` is observed within one poll interval
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         FS Monitor                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  MonitorConfig ──► FsMonitor ──► WatchSession ──► ChangeEvent   │
//! │                       │               │               │         │
//! │                       ▼               ▼               ▼         │
//! │              stop / await_stopped  WatchKey       EventSink     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fs_monitor::{FsMonitor, MonitorConfig, Record};
//!
//! let monitor = FsMonitor::new("fsmonitor-1", MonitorConfig::new(["/var/spool/in"]))?;
//! monitor
//!     .start(|record: Record| {
//!         println!("{}", record["message"]);
//!         Ok(())
//!     })
//!     .await?;
//! ```

pub mod config;
pub mod error;
pub mod event;
mod session;
pub mod watcher;

pub use config::MonitorConfig;
pub use error::{Result, WatcherError};
pub use event::{ChangeEvent, ChangeKind, MESSAGE_KEY, Record, file_id};
pub use watcher::{EventSink, FsMonitor, MonitorState, MonitorStats};
