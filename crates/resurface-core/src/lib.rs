//! Core content model, identity keys and recovery error kinds for Resurface.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Publication state of a content record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    Draft,
    Scheduled,
    Published,
}

/// Canonical content record shared by the snapshot archive, the staged artifact and the
/// live store. Optional fields are omitted on serialization so a decode/encode round trip
/// reproduces the same value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawContentRecord")]
pub struct ContentRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    /// Ordered body blocks, kept verbatim.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub keywords: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ContentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Decoding shape of [`ContentRecord`]. Document-store exports may carry `_id`, `id` or
/// both; a non-blank `id` wins.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawContentRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default, rename = "_id")]
    document_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    title: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    excerpt: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    body: Vec<JsonValue>,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default)]
    published_date: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    keywords: BTreeSet<String>,
    #[serde(default)]
    status: Option<ContentStatus>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl From<RawContentRecord> for ContentRecord {
    fn from(raw: RawContentRecord) -> Self {
        let id = match raw.id {
            Some(id) if !id.trim().is_empty() => Some(id),
            id => raw.document_id.or(id),
        };
        Self {
            id,
            title: raw.title,
            category: raw.category,
            topic: raw.topic,
            excerpt: raw.excerpt,
            body: raw.body,
            image_url: raw.image_url,
            published_date: raw.published_date,
            keywords: raw.keywords,
            status: raw.status,
            created_at: raw.created_at,
            updated_at: raw.updated_at,
        }
    }
}

impl ContentRecord {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: None,
            title: title.into(),
            category: None,
            topic: None,
            excerpt: None,
            body: Vec::new(),
            image_url: None,
            published_date: None,
            keywords: BTreeSet::new(),
            status: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// The record's stable id, if it carries a non-blank one.
    pub fn stable_id(&self) -> Option<&str> {
        self.id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    pub fn identity_key(&self) -> IdentityKey {
        normalize(&self.title)
    }

    pub fn has_title(&self) -> bool {
        !self.title.trim().is_empty()
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Envelope of an exported record sequence: either a bare JSON array or an object holding
/// the array under one of the known field names. Other envelope fields are ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecordContainer {
    Bare(Vec<JsonValue>),
    Wrapped {
        #[serde(alias = "articles", alias = "posts", alias = "content", alias = "items")]
        records: Vec<JsonValue>,
    },
}

impl RecordContainer {
    pub fn into_entries(self) -> Vec<JsonValue> {
        match self {
            Self::Bare(entries) => entries,
            Self::Wrapped { records } => records,
        }
    }
}

/// Title of a raw entry, if it has a non-blank string one.
pub fn entry_title(entry: &JsonValue) -> Option<&str> {
    entry
        .get("title")
        .and_then(JsonValue::as_str)
        .filter(|title| !title.trim().is_empty())
}

/// Comparison key derived from a title. Used only for cross-source matching.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trim surrounding whitespace and lowercase.
pub fn normalize(title: &str) -> IdentityKey {
    IdentityKey(title.trim().to_lowercase())
}

/// How a snapshot record was matched against the live store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "on", rename_all = "snake_case")]
pub enum IdentityMatch {
    MatchedById(String),
    MatchedByTitle(IdentityKey),
    Unmatched,
}

impl IdentityMatch {
    pub fn is_unmatched(&self) -> bool {
        matches!(self, Self::Unmatched)
    }
}

/// Stage-level failures. Any of these aborts the run.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("{} not found", .path.display())]
    NotFound { path: PathBuf },
    #[error("failed to parse {source_name}: {message}")]
    Parse {
        source_name: String,
        message: String,
    },
    #[error("live store unreachable at {endpoint}: {message}")]
    Connection { endpoint: String, message: String },
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-record restore failures. These never abort the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestoreFailure {
    #[error("record has no usable stable id")]
    MissingIdentity,
    #[error("live store rejected upsert: {message}")]
    WriteFailure { message: String },
}
