//! Pending-command payloads
//!
//! A pending command is a command issued to a device whose terminal event has
//! not yet arrived. Pending and terminal events are paired by correlation id;
//! a pending entry may additionally expire on its own when the issuer set a
//! `valid_until` deadline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::Content;

/// The command verbs a pending entry can represent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingCommandKind {
    ResourceCreate,
    ResourceRetrieve,
    ResourceUpdate,
    ResourceDelete,
    DeviceMetadataUpdate,
}

impl PendingCommandKind {
    pub const ALL: [PendingCommandKind; 5] = [
        PendingCommandKind::ResourceCreate,
        PendingCommandKind::ResourceRetrieve,
        PendingCommandKind::ResourceUpdate,
        PendingCommandKind::ResourceDelete,
        PendingCommandKind::DeviceMetadataUpdate,
    ];
}

impl fmt::Display for PendingCommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A pending create/retrieve/update/delete command on one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    pub correlation_id: Uuid,
    /// Requested content, absent for retrieve/delete.
    pub content: Option<Content>,
    pub valid_until: Option<DateTime<Utc>>,
}

impl PendingCommand {
    pub fn new(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            content: None,
            valid_until: None,
        }
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn with_valid_until(mut self, deadline: DateTime<Utc>) -> Self {
        self.valid_until = Some(deadline);
        self
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.valid_until {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }
}

/// Outcome of a completed command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Ok,
    Error,
}

/// Terminal event payload closing a pending command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDone {
    pub correlation_id: Uuid,
    pub status: CommandStatus,
}

/// Requested change to the device metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub twin_enabled: bool,
}

/// A pending device-metadata update command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataUpdatePending {
    pub correlation_id: Uuid,
    pub update: MetadataUpdate,
    pub valid_until: Option<DateTime<Utc>>,
}

impl MetadataUpdatePending {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.valid_until {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }
}
