use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Timestamp = i64;
pub type DocumentId = String;
pub type Fields = Map<String, Value>;

pub const FIELD_TASK: &str = "task";
pub const FIELD_STATUS: &str = "status";

/// A raw document as delivered by a store: identifier plus its field map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Document {
    pub id: DocumentId,
    pub fields: Fields,
}

/// Ordered full state of a collection at one point in time.
pub type Snapshot = Vec<Document>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Status {
    #[default]
    Due,
    Done,
    Late,
    /// Anything written to the store by another client that this board does not know.
    Other(String),
}

impl Status {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "due" => Status::Due,
            "done" => Status::Done,
            "late" => Status::Late,
            other => Status::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Status::Due => "due",
            Status::Done => "done",
            Status::Late => "late",
            Status::Other(raw) => raw,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Status {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Status {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Status::parse(&raw))
    }
}

/// Field payload written when a task is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskFields {
    pub task: String,
    pub status: Status,
}

impl TaskFields {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            status: Status::Due,
        }
    }

    pub fn into_fields(self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(FIELD_TASK.to_string(), Value::String(self.task));
        fields.insert(
            FIELD_STATUS.to_string(),
            Value::String(self.status.as_str().to_string()),
        );
        fields
    }
}

pub fn status_patch(status: &Status) -> Fields {
    let mut fields = Fields::new();
    fields.insert(
        FIELD_STATUS.to_string(),
        Value::String(status.as_str().to_string()),
    );
    fields
}

/// A task record as the board shows it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    pub id: DocumentId,
    pub task: String,
    pub status: Status,
}

impl Task {
    /// Copies a document verbatim. Missing or non-string fields degrade instead of failing:
    /// the text falls back to the JSON rendering and the status to an unknown value.
    pub fn from_document(doc: &Document) -> Self {
        let task = match doc.fields.get(FIELD_TASK) {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let status = match doc.fields.get(FIELD_STATUS) {
            Some(Value::String(raw)) => Status::parse(raw),
            Some(Value::Null) | None => Status::Other(String::new()),
            Some(other) => Status::Other(other.to_string()),
        };
        Self {
            id: doc.id.clone(),
            task,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Local,
    Firestore,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FirestoreSettings {
    #[serde(default = "default_firestore_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_firestore_database")]
    pub database: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            endpoint: default_firestore_endpoint(),
            project_id: String::new(),
            database: default_firestore_database(),
            api_key: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Settings {
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub firestore: FirestoreSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            collection: default_collection(),
            backend: Backend::Local,
            firestore: FirestoreSettings::default(),
        }
    }
}

fn default_collection() -> String {
    "tasks".to_string()
}

fn default_firestore_endpoint() -> String {
    "https://firestore.googleapis.com".to_string()
}

fn default_firestore_database() -> String {
    "(default)".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SettingsFile {
    pub schema_version: u32,
    pub settings: Settings,
}

/// On-disk layout of the local store: every collection with its documents in delivery order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CollectionsFile {
    pub schema_version: u32,
    #[serde(default)]
    pub collections: Vec<CollectionData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CollectionData {
    pub name: String,
    #[serde(default)]
    pub documents: Vec<Document>,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}
