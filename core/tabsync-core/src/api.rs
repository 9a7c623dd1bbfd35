//! REST client for the remote document service.
//!
//! Every call carries the bearer token from the current connection settings
//! and unwraps the service's `{status, message, payload}` envelope. There is
//! no per-call deadline beyond the client's connect timeout; a hung call only
//! stalls its own caller.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tabsync_protocol::{
    parse_assigned_ids, ApiResponse, Context, Document, DocumentBatch, DocumentIdBatch,
    DocumentInput, ErrorInfo,
};
use tracing::debug;
use url::Url;

use crate::error::{Result, SyncError};
use crate::settings::ConnectionSettings;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_PREVIEW: usize = 200;

/// Typed operations of the remote service consumed by the gateway.
#[async_trait]
pub trait DocumentApi: Send + Sync {
    async fn get_context(&self, context_id: &str) -> Result<Context>;
    async fn list_contexts(&self) -> Result<Vec<Context>>;
    async fn get_context_tree(&self, context_id: &str) -> Result<Value>;
    async fn set_context_url(&self, context_id: &str, url: &str) -> Result<Context>;

    async fn list_documents(&self, context_id: &str) -> Result<Vec<Document>>;
    /// Returns the server-assigned ids in request order.
    async fn insert_documents(
        &self,
        context_id: &str,
        documents: &[DocumentInput],
        context_bitmap_array: &[String],
    ) -> Result<Vec<String>>;
    async fn update_document(
        &self,
        context_id: &str,
        doc_id: &str,
        document: &DocumentInput,
    ) -> Result<()>;
    /// Detaches documents from the context; they remain stored.
    async fn remove_documents(&self, context_id: &str, doc_ids: &[String]) -> Result<()>;
    /// Deletes documents from the database.
    async fn delete_documents(&self, context_id: &str, doc_ids: &[String]) -> Result<()>;

    async fn verify_token(&self) -> Result<bool>;
    async fn create_token(&self, name: &str) -> Result<String>;

    /// Swaps the settings used by subsequent calls.
    fn update_settings(&self, _settings: ConnectionSettings) {}
}

pub struct RestDocumentApi {
    http: Client,
    settings: RwLock<ConnectionSettings>,
}

impl RestDocumentApi {
    pub fn new(settings: ConnectionSettings) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|source| SyncError::Http {
                context: "building HTTP client".to_string(),
                source,
            })?;

        Ok(Self {
            http,
            settings: RwLock::new(settings),
        })
    }

    fn settings(&self) -> ConnectionSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn send<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> Result<ApiResponse<T>> {
        let settings = self.settings();
        let url = endpoint(&settings, segments)?;
        debug!(operation, method = %method, url = %url, "REST call");

        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(settings.api_token.trim())
            .header(header::ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|source| SyncError::Http {
            context: operation.to_string(),
            source,
        })?;
        let status = response.status();
        let text = response.text().await.map_err(|source| SyncError::Http {
            context: operation.to_string(),
            source,
        })?;

        match serde_json::from_str::<ApiResponse<T>>(&text) {
            Ok(envelope) => Ok(envelope),
            Err(_) if !status.is_success() => Err(SyncError::Remote {
                operation: operation.to_string(),
                code: status.as_u16().to_string(),
                message: text.chars().take(ERROR_BODY_PREVIEW).collect(),
            }),
            Err(err) => Err(SyncError::remote(
                operation,
                ErrorInfo::new("invalid_response", format!("unexpected response body: {}", err)),
            )),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> Result<T> {
        self.send(operation, method, segments, body)
            .await?
            .into_payload()
            .map_err(|info| SyncError::remote(operation, info))
    }

    /// For calls whose payload carries nothing the caller needs.
    async fn call_unit(
        &self,
        operation: &'static str,
        method: Method,
        segments: &[&str],
        body: Option<Value>,
    ) -> Result<()> {
        let envelope: ApiResponse<Value> = self.send(operation, method, segments, body).await?;
        if envelope.is_success() {
            return Ok(());
        }
        envelope
            .into_payload()
            .map(|_| ())
            .map_err(|info| SyncError::remote(operation, info))
    }
}

#[async_trait]
impl DocumentApi for RestDocumentApi {
    async fn get_context(&self, context_id: &str) -> Result<Context> {
        let context: Context = self
            .call("get context", Method::GET, &["contexts", context_id], None)
            .await?;
        context.validate()?;
        Ok(context)
    }

    async fn list_contexts(&self) -> Result<Vec<Context>> {
        let contexts: Vec<Context> = self
            .call("list contexts", Method::GET, &["contexts"], None)
            .await?;
        Ok(contexts)
    }

    async fn get_context_tree(&self, context_id: &str) -> Result<Value> {
        self.call(
            "get context tree",
            Method::GET,
            &["contexts", context_id, "tree"],
            None,
        )
        .await
    }

    async fn set_context_url(&self, context_id: &str, url: &str) -> Result<Context> {
        let context: Context = self
            .call(
                "set context url",
                Method::POST,
                &["contexts", context_id, "url"],
                Some(json!({ "url": url })),
            )
            .await?;
        context.validate()?;
        Ok(context)
    }

    async fn list_documents(&self, context_id: &str) -> Result<Vec<Document>> {
        self.call(
            "list documents",
            Method::GET,
            &["contexts", context_id, "documents"],
            None,
        )
        .await
    }

    async fn insert_documents(
        &self,
        context_id: &str,
        documents: &[DocumentInput],
        context_bitmap_array: &[String],
    ) -> Result<Vec<String>> {
        let batch = documents.len() != 1;
        let operation = if batch {
            "insert documents"
        } else {
            "insert document"
        };
        let mut segments = vec!["contexts", context_id, "documents"];
        if batch {
            segments.push("batch");
        }
        let body = encode(operation, &DocumentBatch::tabs(documents, context_bitmap_array))?;

        let payload: Value = self.call(operation, Method::POST, &segments, Some(body)).await?;
        let ids = parse_assigned_ids(payload).map_err(|info| SyncError::remote(operation, info))?;
        if ids.len() != documents.len() {
            return Err(SyncError::remote(
                operation,
                ErrorInfo::new(
                    "id_count_mismatch",
                    format!("sent {} documents, got {} ids", documents.len(), ids.len()),
                ),
            ));
        }
        Ok(ids)
    }

    async fn update_document(
        &self,
        context_id: &str,
        doc_id: &str,
        document: &DocumentInput,
    ) -> Result<()> {
        let mut body = encode("update document", document)?;
        if let Value::Object(map) = &mut body {
            map.insert("id".to_string(), Value::String(doc_id.to_string()));
        }
        self.call_unit(
            "update document",
            Method::PUT,
            &["contexts", context_id, "documents"],
            Some(json!({ "documents": [body] })),
        )
        .await
    }

    async fn remove_documents(&self, context_id: &str, doc_ids: &[String]) -> Result<()> {
        let body = encode("remove documents", &DocumentIdBatch { ids: doc_ids })?;
        self.call_unit(
            "remove documents",
            Method::DELETE,
            &["contexts", context_id, "documents", "remove"],
            Some(body),
        )
        .await
    }

    async fn delete_documents(&self, context_id: &str, doc_ids: &[String]) -> Result<()> {
        let body = encode("delete documents", &DocumentIdBatch { ids: doc_ids })?;
        self.call_unit(
            "delete documents",
            Method::DELETE,
            &["contexts", context_id, "documents"],
            Some(body),
        )
        .await
    }

    async fn verify_token(&self) -> Result<bool> {
        let token = self.settings().api_token;
        let envelope: ApiResponse<Value> = self
            .send(
                "verify token",
                Method::POST,
                &["auth", "token", "verify"],
                Some(json!({ "token": token })),
            )
            .await?;
        Ok(envelope.is_success())
    }

    async fn create_token(&self, name: &str) -> Result<String> {
        let payload: Value = self
            .call(
                "create token",
                Method::POST,
                &["auth", "tokens"],
                Some(json!({ "name": name })),
            )
            .await?;
        token_from_payload(&payload).ok_or_else(|| {
            SyncError::remote(
                "create token",
                ErrorInfo::new("missing_token", "response carried no token"),
            )
        })
    }

    fn update_settings(&self, settings: ConnectionSettings) {
        let mut current = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = settings;
    }
}

/// Builds an API url from raw path segments, percent-encoding each one so
/// owner-scoped context ids stay a single segment.
fn endpoint(settings: &ConnectionSettings, segments: &[&str]) -> Result<Url> {
    let mut url = settings.api_url("")?;
    url.path_segments_mut()
        .map_err(|()| SyncError::invalid_settings("host", "url cannot carry a path"))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn encode<T: Serialize + ?Sized>(operation: &str, body: &T) -> Result<Value> {
    serde_json::to_value(body).map_err(|source| SyncError::Json {
        context: format!("encoding {}", operation),
        source,
    })
}

fn token_from_payload(payload: &Value) -> Option<String> {
    let token = match payload {
        Value::String(token) => Some(token.as_str()),
        Value::Object(map) => map.get("token").and_then(Value::as_str),
        _ => None,
    }?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
