//! Persistent model of one encrypted volume and its liveness bookkeeping.

use crate::error::{KeywardenError, KeywardenResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use zeroize::Zeroize;

/// Cadence clients are contracted to report liveness at.
pub const ALIVE_INTERVAL_SEC: i64 = 10;
/// Missed intervals before a host counts as dead. Minimum enforced by
/// [`Record::validate`].
pub const MIN_ALIVE_COUNT: i64 = 2;
/// Alive count assigned to newly created records (40 second window).
pub const DEFAULT_ALIVE_COUNT: i64 = 4;
/// Length of every volume key, in bytes.
pub const KEY_LEN: usize = 64;

/// File systems a client may create when auto-encryption formats a device.
pub const FILE_SYSTEM_CHOICES: &[&str] = &["ext4", "ext3", "xfs", "btrfs"];

/// Device identifiers that are not file-system UUIDs carry this prefix
/// followed by the block device serial number.
pub const SERIAL_ID_PREFIX: &str = "SERIAL:";

/// Liveness report from one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliveMessage {
    pub ip: String,
    pub hostname: String,
    pub timestamp: i64,
}

/// Who retrieved the key most recently.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastRetrieval {
    pub ip: String,
    pub hostname: String,
    pub timestamp: i64,
}

/// Action an operator asks a client to perform on its next poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandContent {
    Mount,
    Umount,
}

impl fmt::Display for CommandContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandContent::Mount => write!(f, "mount"),
            CommandContent::Umount => write!(f, "umount"),
        }
    }
}

impl std::str::FromStr for CommandContent {
    type Err = KeywardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mount" => Ok(CommandContent::Mount),
            "umount" => Ok(CommandContent::Umount),
            other => Err(KeywardenError::Invalid(format!(
                "unknown command content `{other}` (expected mount or umount)"
            ))),
        }
    }
}

/// Operator-issued instruction addressed to one host IP.
///
/// A command is visible to polling while `valid_from <= now <
/// valid_from + validity_secs` and it has not been fetched yet. A fetched
/// command is retained until it expires so its result stays inspectable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub id: u64,
    pub valid_from: i64,
    pub validity_secs: i64,
    pub content: CommandContent,
    pub seen_by_client: bool,
    pub client_result: String,
}

impl PendingCommand {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.valid_from + self.validity_secs
    }

    pub fn is_visible(&self, now: i64) -> bool {
        !self.seen_by_client && now >= self.valid_from && !self.is_expired(now)
    }
}

/// One record per encrypted volume, keyed by UUID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Volume identifier; usually the file-system UUID, or
    /// `SERIAL:<serial>` for devices without one.
    pub uuid: String,
    /// Short human-friendly slug, unique within the database.
    pub id: String,
    /// Device-mapper name used when the volume is opened.
    pub mapped_name: String,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    /// Raw 512-bit volume key.
    #[serde(with = "hex::serde")]
    pub key: Vec<u8>,
    /// Maximum number of hosts holding the key at once; 0 means unbounded.
    pub max_active: u32,
    /// Client identities allowed to auto-retrieve; empty means any
    /// authenticated caller.
    pub allowed_clients: BTreeSet<String>,
    /// Permit a client to LUKS-format an unformatted target on first use.
    pub auto_encryption: bool,
    /// File system created when auto-encryption triggers.
    pub file_system: String,
    pub alive_interval_sec: i64,
    pub alive_count: i64,
    pub last_retrieval: LastRetrieval,
    /// Host IP -> recent alive reports, newest last.
    pub alive_messages: BTreeMap<String, Vec<AliveMessage>>,
    /// Host IP -> pending commands addressed to that host.
    pub pending_commands: BTreeMap<String, Vec<PendingCommand>>,
    /// Monotonic counter backing `PendingCommand::id`.
    pub next_command_id: u64,
}

impl Drop for Record {
    fn drop(&mut self) {
        // Key material must not linger in freed memory.
        self.key.zeroize();
    }
}

impl Record {
    /// Construct a record with liveness defaults; the caller supplies the key.
    pub fn new(uuid: impl Into<String>, key: Vec<u8>) -> Self {
        let uuid = uuid.into();
        let id = slug_from_uuid(&uuid);
        Record {
            uuid,
            id,
            mapped_name: String::new(),
            mount_point: String::new(),
            mount_options: Vec::new(),
            key,
            max_active: 0,
            allowed_clients: BTreeSet::new(),
            auto_encryption: false,
            file_system: String::new(),
            alive_interval_sec: ALIVE_INTERVAL_SEC,
            alive_count: DEFAULT_ALIVE_COUNT,
            last_retrieval: LastRetrieval::default(),
            alive_messages: BTreeMap::new(),
            pending_commands: BTreeMap::new(),
            next_command_id: 1,
        }
    }

    /// Check the invariants every persisted record must satisfy.
    pub fn validate(&self) -> KeywardenResult<()> {
        if self.uuid.trim().is_empty() {
            return Err(KeywardenError::Invalid("record UUID is empty".into()));
        }
        if self.key.len() != KEY_LEN {
            return Err(KeywardenError::Invalid(format!(
                "record {} carries a {}-byte key (need {KEY_LEN})",
                self.uuid,
                self.key.len()
            )));
        }
        if self.alive_interval_sec <= 0 {
            return Err(KeywardenError::Invalid(format!(
                "record {} has non-positive alive interval",
                self.uuid
            )));
        }
        if self.alive_count < MIN_ALIVE_COUNT {
            return Err(KeywardenError::Invalid(format!(
                "record {} alive count {} is below the minimum of {MIN_ALIVE_COUNT}",
                self.uuid, self.alive_count
            )));
        }
        if self.auto_encryption
            && !self.file_system.is_empty()
            && !FILE_SYSTEM_CHOICES.contains(&self.file_system.as_str())
        {
            return Err(KeywardenError::Invalid(format!(
                "record {} requests unsupported file system `{}`",
                self.uuid, self.file_system
            )));
        }
        Ok(())
    }

    /// Seconds without a report after which a host counts as dead.
    pub fn alive_window_secs(&self) -> i64 {
        self.alive_interval_sec * self.alive_count
    }

    /// Drop alive messages older than the liveness window, and hosts that
    /// have none left. Applied before a record is examined or emitted.
    pub fn remove_dead_hosts(&mut self, now: i64) {
        let window = self.alive_window_secs();
        for messages in self.alive_messages.values_mut() {
            messages.retain(|msg| now - msg.timestamp < window);
        }
        self.alive_messages.retain(|_, messages| !messages.is_empty());
    }

    /// Number of distinct hosts currently inside the liveness window.
    pub fn active_host_count(&self) -> usize {
        self.alive_messages.len()
    }

    pub fn is_host_active(&self, ip: &str) -> bool {
        self.alive_messages.contains_key(ip)
    }

    /// Append an alive report, capping the per-host history at `alive_count`
    /// entries.
    pub fn push_alive(&mut self, ip: &str, hostname: &str, now: i64) {
        let messages = self.alive_messages.entry(ip.to_string()).or_default();
        messages.push(AliveMessage {
            ip: ip.to_string(),
            hostname: hostname.to_string(),
            timestamp: now,
        });
        let cap = self.alive_count.max(MIN_ALIVE_COUNT) as usize;
        if messages.len() > cap {
            let excess = messages.len() - cap;
            messages.drain(..excess);
        }
    }

    pub fn touch_retrieval(&mut self, ip: &str, hostname: &str, now: i64) {
        self.last_retrieval = LastRetrieval {
            ip: ip.to_string(),
            hostname: hostname.to_string(),
            timestamp: now,
        };
    }

    /// Queue a command for `ip` and return its assigned id.
    pub fn add_pending_command(
        &mut self,
        ip: &str,
        content: CommandContent,
        valid_from: i64,
        validity_secs: i64,
    ) -> u64 {
        let id = self.next_command_id;
        self.next_command_id += 1;
        self.pending_commands
            .entry(ip.to_string())
            .or_default()
            .push(PendingCommand {
                id,
                valid_from,
                validity_secs,
                content,
                seen_by_client: false,
                client_result: String::new(),
            });
        id
    }

    pub fn clear_pending_commands(&mut self) {
        self.pending_commands.clear();
    }

    /// Drop commands whose validity has lapsed.
    pub fn remove_expired_commands(&mut self, now: i64) {
        for commands in self.pending_commands.values_mut() {
            commands.retain(|cmd| !cmd.is_expired(now));
        }
        self.pending_commands
            .retain(|_, commands| !commands.is_empty());
    }

    /// Return the next visible command for `ip`, marking it as fetched.
    pub fn take_visible_command(&mut self, ip: &str, now: i64) -> Option<PendingCommand> {
        let commands = self.pending_commands.get_mut(ip)?;
        let cmd = commands.iter_mut().find(|cmd| cmd.is_visible(now))?;
        cmd.seen_by_client = true;
        Some(cmd.clone())
    }

    /// Attach a client-reported result to the addressed command.
    pub fn save_command_result(&mut self, ip: &str, command_id: u64, text: &str) -> bool {
        let Some(commands) = self.pending_commands.get_mut(ip) else {
            return false;
        };
        match commands.iter_mut().find(|cmd| cmd.id == command_id) {
            Some(cmd) => {
                cmd.client_result = text.to_string();
                true
            }
            None => false,
        }
    }

    /// Returns false when the client was already present.
    pub fn add_allowed_client(&mut self, client: &str) -> bool {
        self.allowed_clients.insert(client.trim().to_string())
    }

    /// Returns false when there was nothing to remove.
    pub fn remove_allowed_client(&mut self, client: &str) -> bool {
        self.allowed_clients.remove(client.trim())
    }

    pub fn allowed_clients_str(&self) -> String {
        self.allowed_clients
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn mount_options_str(&self) -> String {
        self.mount_options.join(",")
    }
}

/// Split a comma-separated list into trimmed, non-empty entries.
pub fn split_comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| item.to_string())
        .collect()
}

/// Derive the short slug from a device identifier: the leading run of
/// alphanumeric characters, lower-cased, capped at 12 characters.
pub fn slug_from_uuid(uuid: &str) -> String {
    let trimmed = uuid.strip_prefix(SERIAL_ID_PREFIX).unwrap_or(uuid);
    trimmed
        .chars()
        .take_while(|ch| ch.is_ascii_alphanumeric())
        .take(12)
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}
