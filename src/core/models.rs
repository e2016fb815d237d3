use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use url::Url;

/// A message delivered to the inbox.
#[derive(Debug, Clone, PartialEq)]
pub struct InboxMessage {
    pub id: String,
    pub subject: String,
    pub content: String,
    pub icon_url: Option<Url>,
    pub main_image_url: Option<Url>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub collapse_key: Option<String>,
    pub custom_data: Map<String, Value>,
    /// Opaque data for the host app.
    pub client_app_data: Map<String, Value>,
    /// Campaign references (`activity_type`, `activity_uid`) used when
    /// reporting opens.
    pub app_ref_data: Map<String, Value>,
}

impl InboxMessage {
    pub fn new(id: impl Into<String>, subject: impl Into<String>, received_at: DateTime<Utc>) -> Self {
        InboxMessage {
            id: id.into(),
            subject: subject.into(),
            content: String::new(),
            icon_url: None,
            main_image_url: None,
            received_at,
            is_read: false,
            expires_at: None,
            collapse_key: None,
            custom_data: Map::new(),
            client_app_data: Map::new(),
            app_ref_data: Map::new(),
        }
    }

    /// True once `now` has reached the expiry timestamp.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// One validated record of a sync batch.
///
/// `read` is the server's read assertion for the message; `None` means the
/// record did not carry one and the local flag is kept.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteMessage {
    pub message: InboxMessage,
    pub read: Option<bool>,
}

impl From<InboxMessage> for RemoteMessage {
    fn from(message: InboxMessage) -> Self {
        RemoteMessage {
            message,
            read: None,
        }
    }
}

/// Counts reported by a full reconciliation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileResult {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

/// Why a single wire record was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record is not an object")]
    NotAnObject,

    #[error("missing message_uid")]
    MissingId,

    #[error("missing content")]
    MissingContent,

    #[error("bad {field} timestamp {value:?}")]
    BadTimestamp { field: &'static str, value: String },
}

/// One inbox record as the messages endpoints return it.
///
/// Only `message_uid` and `content` are required. Every other field is read
/// if it has the expected type and ignored otherwise, `null` included.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    fields: Map<String, Value>,
}

impl MessageRecord {
    pub fn from_value(value: Value) -> Result<Self, RecordError> {
        match value {
            Value::Object(fields) => Ok(MessageRecord { fields }),
            _ => Err(RecordError::NotAnObject),
        }
    }

    /// Parse and validate one JSON value from a batch.
    ///
    /// `fetched_at` stands in for a missing `created_at`.
    pub fn parse(value: Value, fetched_at: DateTime<Utc>) -> Result<RemoteMessage, RecordError> {
        Self::from_value(value)?.into_remote(fetched_at)
    }

    fn into_remote(mut self, fetched_at: DateTime<Utc>) -> Result<RemoteMessage, RecordError> {
        let id = self
            .take_str("message_uid")
            .filter(|id| !id.is_empty())
            .ok_or(RecordError::MissingId)?;
        let content = self.take_str("content").ok_or(RecordError::MissingContent)?;

        let received_at = match self.take_str("created_at") {
            Some(raw) => parse_timestamp(&raw).ok_or(RecordError::BadTimestamp {
                field: "created_at",
                value: raw,
            })?,
            None => fetched_at,
        };

        // An unreadable expiry is ignored rather than hiding the message.
        let expires_at = self.take_str("expires_at").and_then(|raw| {
            let parsed = parse_timestamp(&raw);
            if parsed.is_none() {
                log::debug!("Ignoring bad expires_at {:?} on {}", raw, id);
            }
            parsed
        });

        let images = self.take_object("images");
        let image_url = |key: &str| images.get(key).and_then(Value::as_str).and_then(parse_url);
        let detail = self.take_str("detail");
        let icon_url = image_url("icon").or_else(|| detail.as_deref().and_then(parse_url));
        let main_image_url = image_url("main");

        let read = self.fields.get("read").and_then(Value::as_bool);

        Ok(RemoteMessage {
            message: InboxMessage {
                subject: self.take_str("subject").unwrap_or_default(),
                content,
                icon_url,
                main_image_url,
                received_at,
                is_read: read.unwrap_or(false),
                expires_at,
                collapse_key: self.take_str("collapse_key"),
                custom_data: self.take_object("inbox_custom_data"),
                client_app_data: self.take_object("client_app_data"),
                app_ref_data: self.take_object("apprefdata"),
                id,
            },
            read,
        })
    }

    fn take_str(&mut self, key: &str) -> Option<String> {
        match self.fields.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    fn take_object(&mut self, key: &str) -> Map<String, Value> {
        match self.fields.remove(key) {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

fn parse_url(raw: &str) -> Option<Url> {
    Url::parse(raw).ok()
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
