//! Change events emitted by the monitor.
//!
//! A [`ChangeEvent`] is serialized for the host as a single-line JSON object
//! with the keys `fileId`, `fileName`, `filePath` and `eventType`, in that
//! order, and handed over under the `message` key of a [`Record`].

use std::ffi::OsStr;
use std::fmt;
use std::path::{Path, PathBuf};

use notify::EventKind;
use notify::event::{ModifyKind, RenameMode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Record handed to the sink.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Key under which the serialized event is stored in a [`Record`].
pub const MESSAGE_KEY: &str = "message";

/// Namespace for [`file_id`] UUIDs.
const FILE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a4e_93b7_4d0a_8c55_e2f1_7b3d_9a60);

/// Deterministic id for an entry inside a directory.
///
/// Hashes the raw OS bytes of directory and name joined with a NUL byte,
/// which neither can contain, so distinct pairs never hash the same input.
pub fn file_id(directory: impl AsRef<OsStr>, name: impl AsRef<OsStr>) -> Uuid {
    let directory = directory.as_ref().as_encoded_bytes();
    let name = name.as_ref().as_encoded_bytes();

    let mut input = Vec::with_capacity(directory.len() + name.len() + 1);
    input.extend_from_slice(directory);
    input.push(0);
    input.extend_from_slice(name);
    Uuid::new_v5(&FILE_ID_NAMESPACE, &input)
}

/// Kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    /// Entry was created (or renamed into the directory).
    Create,

    /// Entry content or metadata changed.
    Modify,

    /// Entry was deleted (or renamed out of the directory).
    Delete,

    /// The OS dropped notifications; the consumer's view may be incomplete.
    Overflow,
}

impl ChangeKind {
    /// Wire name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Modify => "MODIFY",
            Self::Delete => "DELETE",
            Self::Overflow => "OVERFLOW",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized change inside a watched directory.
///
/// `file_name` and `file_path` are lossy UTF-8 renderings, so two non-UTF-8
/// names may print the same; `file_id` is taken from the raw bytes and still
/// tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// Id derived from the directory and entry name.
    pub file_id: Uuid,

    /// Entry name relative to its directory. Empty for overflow events.
    pub file_name: String,

    /// Containing directory, as configured.
    pub file_path: String,

    /// What happened.
    pub event_type: ChangeKind,
}

impl ChangeEvent {
    /// Create an event for `name` inside `directory`.
    pub fn new(directory: &Path, name: impl AsRef<OsStr>, kind: ChangeKind) -> Self {
        let name = name.as_ref();
        Self {
            file_id: file_id(directory, name),
            file_name: name.to_string_lossy().into_owned(),
            file_path: directory.to_string_lossy().into_owned(),
            event_type: kind,
        }
    }

    /// Create an overflow marker for `directory`.
    pub fn overflow(directory: &Path) -> Self {
        Self::new(directory, "", ChangeKind::Overflow)
    }

    /// Serialize to the single-line message form.
    pub fn to_message(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wrap the message in a sink record.
    pub fn to_record(&self) -> Result<Record> {
        let mut record = Record::new();
        record.insert(
            MESSAGE_KEY.to_string(),
            serde_json::Value::String(self.to_message()?),
        );
        Ok(record)
    }
}

/// A notification reduced to what the monitor cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RawChange {
    /// A change to the entry at `path`.
    Entry { path: PathBuf, kind: ChangeKind },

    /// Notifications were lost.
    Overflow,
}

/// Reduce a notify event to raw changes, in the order notify reported them.
pub(crate) fn classify(event: &notify::Event) -> Vec<RawChange> {
    if event.need_rescan() {
        return vec![RawChange::Overflow];
    }

    let entry = |path: &PathBuf, kind| RawChange::Entry {
        path: path.clone(),
        kind,
    };

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| entry(p, ChangeKind::Create))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| entry(p, ChangeKind::Delete))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => event
                .paths
                .iter()
                .map(|p| entry(p, ChangeKind::Delete))
                .collect(),
            RenameMode::To => event
                .paths
                .iter()
                .map(|p| entry(p, ChangeKind::Create))
                .collect(),
            // Trackers pair this with `From`/`To` halves that were already reported.
            RenameMode::Both if event.tracker().is_some() => Vec::new(),
            RenameMode::Both => {
                let mut changes = Vec::with_capacity(2);
                if let Some(from) = event.paths.first() {
                    changes.push(entry(from, ChangeKind::Delete));
                }
                if let Some(to) = event.paths.get(1) {
                    changes.push(entry(to, ChangeKind::Create));
                }
                changes
            }
            // Direction unknown: whatever is on disk now tells us which side we saw.
            RenameMode::Any | RenameMode::Other => event
                .paths
                .iter()
                .map(|p| {
                    let kind = if p.exists() {
                        ChangeKind::Create
                    } else {
                        ChangeKind::Delete
                    };
                    entry(p, kind)
                })
                .collect(),
        },
        EventKind::Modify(_) | EventKind::Any => event
            .paths
            .iter()
            .map(|p| entry(p, ChangeKind::Modify))
            .collect(),
        EventKind::Access(_) | EventKind::Other => Vec::new(),
    }
}
