//! Sync engine configuration, statistics and events.

use core::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};
use crate::network::ConnectionType;

/// Policy for the recurring sync schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Master switch for scheduled cycles. Manual syncs ignore it.
    pub enabled: bool,
    /// Seconds between scheduled cycles.
    pub interval_secs: u64,
    /// Minimum battery percentage for a scheduled cycle.
    pub battery_threshold: u8,
    /// Only run scheduled cycles on Wi-Fi-equivalent connections.
    pub wifi_only: bool,
    /// Retry ceiling applied to operations queued by the interceptor.
    pub max_retries: u32,
    /// Minimum seconds between the end of one cycle and a scheduled start.
    pub min_gap_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            battery_threshold: 20,
            wifi_only: false,
            max_retries: crate::DEFAULT_MAX_RETRIES,
            min_gap_secs: 5,
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn min_gap(&self) -> Duration {
        Duration::from_secs(self.min_gap_secs)
    }
}

/// Running counters for sync cycles.
///
/// Derived data: it is persisted for display across restarts but never used
/// as a source of truth for queue contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncStats {
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
    /// Scheduled cycles skipped by a policy gate.
    pub skipped_syncs: u64,
    /// Running mean of cycle duration in milliseconds.
    pub average_sync_time_ms: f64,
    /// Operations dropped after reaching their retry ceiling.
    pub exhausted_operations: u64,
    /// Operations removed because the server reported a conflict.
    pub conflicts: u64,
    pub pending_operations: u64,
    pub battery_level: Option<u8>,
    pub connection_type: ConnectionType,
    pub last_error: Option<String>,
}

impl SyncStats {
    /// Fold one finished cycle into the counters.
    pub fn record_cycle(&mut self, duration: Duration, success: bool, at: OffsetDateTime) {
        self.total_syncs += 1;
        if success {
            self.successful_syncs += 1;
        } else {
            self.failed_syncs += 1;
        }
        let ms = duration.as_secs_f64() * 1000.0;
        let n = self.total_syncs as f64;
        self.average_sync_time_ms += (ms - self.average_sync_time_ms) / n;
        self.last_sync = Some(at);
    }
}

/// Observable state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    /// Interval-driven scheduling is running.
    Active,
    /// A cycle is in progress.
    Syncing,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Active => write!(f, "active"),
            Self::Syncing => write!(f, "syncing"),
        }
    }
}

/// Why a scheduled cycle did not run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SkipReason {
    Disabled,
    Offline,
    NotWifi,
    LowBattery { level: u8, threshold: u8 },
    TooSoon,
    /// Another drain was already in flight.
    AlreadyRunning,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "sync disabled"),
            Self::Offline => write!(f, "offline"),
            Self::NotWifi => write!(f, "not on Wi-Fi"),
            Self::LowBattery { level, threshold } => {
                write!(f, "battery {}% below {}%", level, threshold)
            }
            Self::TooSoon => write!(f, "previous sync too recent"),
            Self::AlreadyRunning => write!(f, "sync already running"),
        }
    }
}

/// Notifications emitted by the sync engine.
///
/// All events are serializable for logging and IPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SyncEvent {
    /// A cycle began.
    Started { scheduled: bool },
    /// A cycle finished its drain.
    Completed {
        succeeded: u32,
        failed: u32,
        exhausted: u32,
        conflicts: u32,
        evicted: usize,
        duration_ms: u64,
    },
    /// A cycle aborted with an error.
    Failed { error: String },
    /// A scheduled cycle was skipped.
    Skipped { reason: SkipReason },
    /// Scheduling stopped.
    Paused,
    /// Scheduling started.
    Resumed,
}

/// Logical background sync channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTag {
    General,
    Users,
    Tasks,
    Calendar,
}

impl SyncTag {
    /// Every tag, in registration order.
    pub const ALL: [SyncTag; 4] = [Self::General, Self::Users, Self::Tasks, Self::Calendar];

    /// Platform-facing tag name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::General => "background-sync",
            Self::Users => "sync-users",
            Self::Tasks => "sync-tasks",
            Self::Calendar => "sync-calendar",
        }
    }

    /// Cooldown between two non-forced registrations of this tag.
    pub fn min_interval(&self) -> Duration {
        match self {
            Self::General => Duration::from_secs(300),
            _ => Duration::from_secs(120),
        }
    }
}

impl fmt::Display for SyncTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTag {
    type Err = ParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        match s.to_ascii_lowercase().as_str() {
            "general" | "background-sync" => Ok(Self::General),
            "users" | "sync-users" => Ok(Self::Users),
            "tasks" | "sync-tasks" => Ok(Self::Tasks),
            "calendar" | "sync-calendar" => Ok(Self::Calendar),
            _ => Err(ParseError::unknown("sync tag", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Completed,
    Failed,
}

/// In-memory record of a background sync request, kept for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundSyncRegistration {
    pub tag: SyncTag,
    pub status: RegistrationStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub registered_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_update: Option<OffsetDateTime>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl BackgroundSyncRegistration {
    pub fn pending(tag: SyncTag, now: OffsetDateTime) -> Self {
        Self {
            tag,
            status: RegistrationStatus::Pending,
            registered_at: now,
            last_update: None,
            retry_count: 0,
            last_error: None,
        }
    }
}
