//! Audit messages and followers
//!
//! Messages are immutable audit entries weakly linked to their parent by
//! `(model_name, model_id)` so the trail survives even a hard delete of the
//! parent row. Followers subscribe a user to every commit touching an entity.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{changes_from_json, changes_to_json, ChangeSet, Kind};
use crate::error::{Result, UdbError};

/// What a message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Entity creation
    New,
    /// Entity update with a non-empty change set
    Dirty,
    /// Free-text comment supplied by a caller
    Comment,
    /// A child mutation that logically touches this entity
    Parent,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::New => "new",
            MessageType::Dirty => "dirty",
            MessageType::Comment => "comment",
            MessageType::Parent => "parent",
        }
    }
}

impl FromStr for MessageType {
    type Err = UdbError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "new" => Ok(MessageType::New),
            "dirty" => Ok(MessageType::Dirty),
            "comment" => Ok(MessageType::Comment),
            "parent" => Ok(MessageType::Parent),
            other => Err(UdbError::Fatal(format!("invalid message type `{other}`"))),
        }
    }
}

/// An immutable audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<i64>,
    pub model_name: String,
    pub model_id: i64,
    /// Author user id; absent for system-generated entries
    pub author_id: Option<i64>,
    #[serde(rename = "type")]
    pub mtype: MessageType,
    #[serde(default)]
    pub body: String,
    pub changes: Option<ChangeSet>,
    pub date: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: Kind, model_id: i64, mtype: MessageType) -> Self {
        Self {
            id: None,
            model_name: kind.table().to_string(),
            model_id,
            author_id: None,
            mtype,
            body: String::new(),
            changes: None,
            date: Utc::now(),
        }
    }

    pub fn comment(kind: Kind, model_id: i64, author_id: Option<i64>, body: impl Into<String>) -> Self {
        let mut message = Message::new(kind, model_id, MessageType::Comment);
        message.author_id = author_id;
        message.body = body.into();
        message
    }

    /// Stored JSON text of the change set, when present.
    pub fn changes_json(&self) -> Option<String> {
        self.changes.as_ref().map(|c| changes_to_json(c).to_string())
    }

    /// Parse the stored change payload; free-text bodies yield `None`.
    pub fn parse_changes(raw: Option<&str>) -> Option<ChangeSet> {
        let raw = raw?;
        if !raw.starts_with('{') {
            return None;
        }
        let value: serde_json::Value = serde_json::from_str(raw).ok()?;
        changes_from_json(&value)
    }
}

/// Subscription of a user to an entity's audit trail, deduplicated on
/// `(model_name, model_id, user_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Follower {
    pub id: Option<i64>,
    pub model_name: String,
    pub model_id: i64,
    pub user_id: i64,
}

impl Follower {
    pub fn new(kind: Kind, model_id: i64, user_id: i64) -> Self {
        Self {
            id: None,
            model_name: kind.table().to_string(),
            model_id,
            user_id,
        }
    }
}
