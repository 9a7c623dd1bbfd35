//! Wire types and validation for the remote document service.
//!
//! This crate is shared by the sync core and its tooling to prevent schema
//! drift. The service remains the authority on stored data; clients validate
//! at the boundary and reject structurally broken records instead of guessing.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Schema tag carried by every tab document.
pub const TAB_SCHEMA: &str = "data/abstraction/tab";
pub const MAX_FRAME_BYTES: usize = 1024 * 1024; // 1MB

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REST envelope
// ═══════════════════════════════════════════════════════════════════════════════

/// Envelope wrapped around every REST response.
#[derive(Debug, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    #[serde(rename = "statusCode", default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default = "Option::default")]
    pub payload: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn is_success(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }

    pub fn into_payload(self) -> Result<T, ErrorInfo> {
        if !self.is_success() {
            let message = self
                .message
                .filter(|message| !message.trim().is_empty())
                .unwrap_or_else(|| format!("status {}", self.status));
            return Err(ErrorInfo::new("request_failed", message));
        }
        self.payload
            .ok_or_else(|| ErrorInfo::new("missing_payload", "response carried no payload"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Documents
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutedInfo {
    pub muted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Tab payload stored inside a document's `data` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabData {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub discarded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub muted_info: Option<MutedInfo>,
    /// Browser tab id at the time the document was written. Not stable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "deserialize_opt_id")]
    pub id: Option<String>,
    pub schema: String,
    #[serde(default)]
    pub data: Value,
}

impl Document {
    pub fn is_tab(&self) -> bool {
        self.schema == TAB_SCHEMA
    }

    /// Extracts the tab payload, rejecting documents without a usable url.
    pub fn tab_data(&self) -> Result<TabData, ErrorInfo> {
        if !self.is_tab() {
            return Err(ErrorInfo::new(
                "unexpected_schema",
                format!("document schema {} is not a tab", self.schema),
            ));
        }
        let data: TabData = serde_json::from_value(self.data.clone()).map_err(|err| {
            ErrorInfo::new(
                "invalid_document",
                format!("tab document payload is invalid: {}", err),
            )
        })?;
        require_str(&data.url, "data.url")?;
        Ok(data)
    }
}

/// Document body sent on insert/update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentInput {
    pub schema: String,
    pub data: TabData,
}

impl DocumentInput {
    pub fn tab(data: TabData) -> Self {
        Self {
            schema: TAB_SCHEMA.to_string(),
            data,
        }
    }
}

/// Body for batch insert/update calls.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentBatch<'a> {
    pub documents: &'a [DocumentInput],
    pub feature_array: Vec<String>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    pub context_bitmap_array: &'a [String],
}

impl<'a> DocumentBatch<'a> {
    pub fn tabs(documents: &'a [DocumentInput], context_bitmap_array: &'a [String]) -> Self {
        Self {
            documents,
            feature_array: vec![TAB_SCHEMA.to_string()],
            context_bitmap_array,
        }
    }
}

/// Body for remove/delete calls, which address documents by id only.
#[derive(Debug, Serialize)]
pub struct DocumentIdBatch<'a> {
    pub ids: &'a [String],
}

/// Reads the ids assigned by an insert call.
///
/// The service answers with an array of ids, an array of stored documents, or
/// a single id/document for single inserts. Order follows the request.
pub fn parse_assigned_ids(payload: Value) -> Result<Vec<String>, ErrorInfo> {
    let items = match payload {
        Value::Array(items) => items,
        other => vec![other],
    };

    items
        .iter()
        .map(|item| {
            id_from_value(item).ok_or_else(|| {
                ErrorInfo::new(
                    "missing_document_id",
                    format!("insert response entry has no document id: {}", item),
                )
            })
        })
        .collect()
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        Value::Object(map) => map.get("id").and_then(id_from_value),
        _ => None,
    }
}

fn deserialize_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => id_from_value(&value)
            .map(Some)
            .ok_or_else(|| de::Error::custom("document id must be a string or number")),
    }
}

fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_opt_id(deserializer)?.ok_or_else(|| de::Error::custom("id is required"))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Contexts
// ═══════════════════════════════════════════════════════════════════════════════

/// A remote scope owning a set of tab documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub url: String,
    /// Opaque bitmap names used to tag documents filed under this context.
    #[serde(default)]
    pub context_bitmap_array: Vec<String>,
}

impl Context {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_str(&self.id, "context.id")
    }

    /// True when both records name the same remote scope.
    pub fn same_scope(&self, other: &Context) -> bool {
        same_context_id(&self.id, &other.id)
    }
}

/// Reduces "owner/scope" style identifiers to their trailing segment.
pub fn normalize_context_id(id: &str) -> &str {
    let trimmed = id.trim().trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

pub fn same_context_id(left: &str, right: &str) -> bool {
    let left = normalize_context_id(left);
    !left.is_empty() && left == normalize_context_id(right)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Push frames
// ═══════════════════════════════════════════════════════════════════════════════

/// One JSON text frame on the real-time connection.
///
/// Outbound requests carry `id`; the matching reply carries `ack` with the
/// same number. Unsolicited server events carry only `event` and `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl WireFrame {
    pub fn event(name: &str, data: Value) -> Self {
        Self {
            event: Some(name.to_string()),
            data,
            ..Self::default()
        }
    }

    pub fn request(id: u64, name: &str, data: Value) -> Self {
        Self {
            id: Some(id),
            event: Some(name.to_string()),
            data,
            ack: None,
        }
    }

    pub fn ack(id: u64, data: Value) -> Self {
        Self {
            ack: Some(id),
            data,
            ..Self::default()
        }
    }
}

pub fn parse_frame(text: &str) -> Result<WireFrame, ErrorInfo> {
    if text.len() > MAX_FRAME_BYTES {
        return Err(ErrorInfo::new(
            "frame_too_large",
            "frame exceeded maximum size",
        ));
    }
    let frame: WireFrame = serde_json::from_str(text).map_err(|err| {
        ErrorInfo::new("invalid_json", format!("frame was not valid JSON: {}", err))
    })?;
    if frame.ack.is_none() && frame.event.as_deref().map_or(true, |e| e.trim().is_empty()) {
        return Err(ErrorInfo::new(
            "missing_field",
            "frame needs either ack or event",
        ));
    }
    Ok(frame)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentAction {
    Insert,
    Update,
    Remove,
    Delete,
}

impl DocumentAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentAction::Insert => "insert",
            DocumentAction::Update => "update",
            DocumentAction::Remove => "remove",
            DocumentAction::Delete => "delete",
        }
    }
}

/// Server-originated events the sync core reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushEvent {
    Authenticated,
    AuthenticationFailed,
    Document(DocumentAction),
    ContextUrlChanged,
}

impl PushEvent {
    /// Maps current and legacy event names onto one variant per action.
    pub fn parse(name: &str) -> Option<Self> {
        let event = match name.trim() {
            "authenticated" | "auth:ok" => PushEvent::Authenticated,
            "authentication_failed" | "auth:error" | "unauthorized" => {
                PushEvent::AuthenticationFailed
            }
            "document.inserted"
            | "documents.inserted"
            | "document:insert"
            | "context:document:insert"
            | "context:documents:insert" => PushEvent::Document(DocumentAction::Insert),
            "document.updated"
            | "documents.updated"
            | "document:update"
            | "context:document:update"
            | "context:documents:update" => PushEvent::Document(DocumentAction::Update),
            "document.removed"
            | "documents.removed"
            | "document:remove"
            | "context:document:remove"
            | "context:documents:remove"
            | "documents:removed" => PushEvent::Document(DocumentAction::Remove),
            "document.deleted"
            | "documents.deleted"
            | "document:delete"
            | "context:document:delete"
            | "context:documents:delete"
            | "documents:deleted" => PushEvent::Document(DocumentAction::Delete),
            "context.url.set"
            | "context.url.changed"
            | "context:url:set"
            | "context:url:changed" => PushEvent::ContextUrlChanged,
            _ => return None,
        };
        Some(event)
    }
}

/// Context identifier carried by a push payload, in any of its spellings.
pub fn event_context_id(data: &Value) -> Option<String> {
    let candidate = data
        .get("contextId")
        .or_else(|| data.get("context_id"))
        .or_else(|| data.get("context"))?;
    match candidate {
        Value::Object(map) => map.get("id").and_then(id_from_value),
        other => id_from_value(other),
    }
}

pub fn event_context_url(data: &Value) -> Option<String> {
    data.get("url")
        .or_else(|| data.get("contextUrl"))
        .or_else(|| data.get("context").and_then(|context| context.get("url")))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

fn require_str(value: &str, field: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            format!("{} is required", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_current_and_legacy_document_events() {
        assert_eq!(
            PushEvent::parse("document.inserted"),
            Some(PushEvent::Document(DocumentAction::Insert))
        );
        assert_eq!(
            PushEvent::parse("context:documents:insert"),
            Some(PushEvent::Document(DocumentAction::Insert))
        );
        assert_eq!(
            PushEvent::parse("documents:removed"),
            Some(PushEvent::Document(DocumentAction::Remove))
        );
        assert_eq!(
            PushEvent::parse("document:delete"),
            Some(PushEvent::Document(DocumentAction::Delete))
        );
        assert_eq!(PushEvent::parse("context:url:set"), Some(PushEvent::ContextUrlChanged));
        assert_eq!(PushEvent::parse("document.exploded"), None);
    }

    #[test]
    fn normalizes_owner_scoped_context_ids() {
        assert_eq!(normalize_context_id("alice/work"), "work");
        assert_eq!(normalize_context_id("work"), "work");
        assert_eq!(normalize_context_id("alice/work/"), "work");
        assert!(same_context_id("alice/work", "work"));
        assert!(!same_context_id("alice/work", "play"));
        assert!(!same_context_id("", ""));
    }

    #[test]
    fn reads_context_id_from_payload_variants() {
        assert_eq!(event_context_id(&json!({"contextId": "work"})), Some("work".into()));
        assert_eq!(event_context_id(&json!({"context_id": 7})), Some("7".into()));
        assert_eq!(
            event_context_id(&json!({"context": {"id": "bob/home"}})),
            Some("bob/home".into())
        );
        assert_eq!(event_context_id(&json!({"documents": []})), None);
    }

    #[test]
    fn assigned_ids_accept_scalars_and_documents() {
        let ids = parse_assigned_ids(json!([1, "2", {"id": 3}])).unwrap();
        assert_eq!(ids, vec!["1", "2", "3"]);

        let single = parse_assigned_ids(json!({"id": 42, "schema": TAB_SCHEMA})).unwrap();
        assert_eq!(single, vec!["42"]);
    }

    #[test]
    fn assigned_ids_reject_entries_without_id() {
        let err = parse_assigned_ids(json!([1, {"schema": TAB_SCHEMA}])).unwrap_err();
        assert_eq!(err.code, "missing_document_id");
    }

    #[test]
    fn tab_data_requires_url() {
        let doc = Document {
            id: Some("1".into()),
            schema: TAB_SCHEMA.into(),
            data: json!({"url": "  ", "title": "Blank"}),
        };
        assert_eq!(doc.tab_data().unwrap_err().code, "missing_field");
    }

    #[test]
    fn tab_data_rejects_other_schemas() {
        let doc = Document {
            id: Some("1".into()),
            schema: "data/abstraction/note".into(),
            data: json!({"url": "https://a.com"}),
        };
        assert_eq!(doc.tab_data().unwrap_err().code, "unexpected_schema");
    }

    #[test]
    fn document_ids_deserialize_from_numbers() {
        let doc: Document = serde_json::from_value(json!({
            "id": 42,
            "schema": TAB_SCHEMA,
            "data": {"url": "https://b.com"}
        }))
        .unwrap();
        assert_eq!(doc.id.as_deref(), Some("42"));
        assert_eq!(doc.tab_data().unwrap().url, "https://b.com");
    }

    #[test]
    fn failed_envelope_surfaces_message() {
        let response: ApiResponse<Value> = serde_json::from_value(json!({
            "status": "error",
            "statusCode": 404,
            "message": "Context not found"
        }))
        .unwrap();
        let err = response.into_payload().unwrap_err();
        assert_eq!(err.code, "request_failed");
        assert_eq!(err.message, "Context not found");
    }

    #[test]
    fn parse_frame_requires_event_or_ack() {
        assert!(parse_frame(r#"{"data": {}}"#).is_err());
        assert!(parse_frame("not json").is_err());
        let frame = parse_frame(r#"{"ack": 3, "data": {"ok": true}}"#).unwrap();
        assert_eq!(frame.ack, Some(3));
    }
}
