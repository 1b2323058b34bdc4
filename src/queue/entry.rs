use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type EntryId = Uuid;

/// The `enabled`/`repeat` pair of a queue entry.
///
/// `repeat` can only be switched on together with `enabled`, and switching
/// `enabled` off always clears `repeat`. The flags are never set one at a
/// time: every change goes through a [`FlagAssignment`]. Stored values are
/// read back exactly as written, so a row edited outside the scheduler can
/// still hold `repeat` without `enabled`; claims only look at `enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawFlags")]
pub struct QueueFlags {
    enabled: bool,
    repeat: bool,
}

#[derive(Deserialize)]
struct RawFlags {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    repeat: bool,
}

impl From<RawFlags> for QueueFlags {
    fn from(raw: RawFlags) -> Self {
        QueueFlags::new(raw.enabled, raw.repeat)
    }
}

impl Default for QueueFlags {
    /// New configurations are queued and auto-repeating.
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl QueueFlags {
    pub fn new(enabled: bool, repeat: bool) -> Self {
        Self { enabled, repeat }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn repeat(&self) -> bool {
        self.repeat
    }

    /// Flags after applying an assignment.
    pub fn apply(self, assignment: FlagAssignment) -> Self {
        Self {
            enabled: assignment.enabled.unwrap_or(self.enabled),
            repeat: assignment.repeat.unwrap_or(self.repeat),
        }
    }
}

/// A cascading change to [`QueueFlags`], expressed as the fields it writes so
/// that stores can apply it in a single update without reading first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagAssignment {
    enabled: Option<bool>,
    repeat: Option<bool>,
}

impl FlagAssignment {
    /// Enabling leaves `repeat` alone; disabling also clears it.
    pub fn set_enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            repeat: if enabled { None } else { Some(false) },
        }
    }

    /// Any change to `repeat` also turns the entry on.
    pub fn set_repeat(repeat: bool) -> Self {
        Self {
            enabled: Some(true),
            repeat: Some(repeat),
        }
    }

    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub fn repeat(&self) -> Option<bool> {
        self.repeat
    }
}

/// Scheduling state of one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(flatten)]
    pub flags: QueueFlags,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed: Option<DateTime<Utc>>,
    /// Free-text status label, informational only.
    #[serde(default)]
    pub state: Option<String>,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            flags: QueueFlags::default(),
            priority: 0,
            running: false,
            started: None,
            completed: None,
            state: None,
        }
    }
}

/// A benchmark configuration together with its queue state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub name: String,
    pub kind: String,
    pub command: String,
    #[serde(default)]
    pub archived: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub queue: QueueState,
}

impl QueueEntry {
    pub fn new(config: NewConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: config.name,
            kind: config.kind,
            command: config.command,
            archived: false,
            created: now,
            updated: now,
            queue: QueueState::default(),
        }
    }

    /// True when a claim could pick this entry, ignoring any caller filter.
    pub fn is_claimable(&self) -> bool {
        !self.queue.running && self.queue.flags.enabled() && !self.archived
    }
}

/// Descriptive fields supplied when a configuration is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConfig {
    pub name: String,
    #[serde(default)]
    pub kind: String,
    pub command: String,
}

impl NewConfig {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            command: command.into(),
        }
    }
}

/// Replacement descriptive fields. Fields left out keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnabledStatus {
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatStatus {
    pub repeat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityUpdate {
    pub priority: i64,
}
