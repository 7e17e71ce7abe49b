//! Firestore REST v1 backend.
//!
//! The value codec and URL layout are plain functions so they can be tested without a
//! network; the HTTP client and the polling subscription are only built with `app`.

use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{SnapshotEvent, SnapshotSender, StoreError, StoreResult};
use crate::models::{Document, Fields, FirestoreSettings};

pub const LIST_PAGE_SIZE: usize = 300;

/// Where a project's documents live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirestoreTarget {
    pub endpoint: String,
    pub project_id: String,
    pub database: String,
    pub api_key: Option<String>,
}

impl FirestoreTarget {
    pub fn from_settings(settings: &FirestoreSettings) -> StoreResult<Self> {
        let project_id = settings.project_id.trim();
        if project_id.is_empty() {
            return Err(StoreError::InvalidFields(
                "firestore.project_id is not configured".to_string(),
            ));
        }
        Ok(Self {
            endpoint: settings.endpoint.trim().trim_end_matches('/').to_string(),
            project_id: project_id.to_string(),
            database: settings.database.trim().to_string(),
            api_key: settings
                .api_key
                .as_ref()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty()),
        })
    }

    pub fn collection_url(&self, collection: &str) -> StoreResult<String> {
        check_segment("collection", collection)?;
        Ok(format!(
            "{}/v1/projects/{}/databases/{}/documents/{}",
            self.endpoint, self.project_id, self.database, collection
        ))
    }

    pub fn document_url(&self, collection: &str, id: &str) -> StoreResult<String> {
        check_segment("document id", id)?;
        Ok(format!("{}/{}", self.collection_url(collection)?, id))
    }
}

fn check_segment(what: &str, value: &str) -> StoreResult<()> {
    if value.is_empty() || value.contains('/') || value == "." || value == ".." {
        return Err(StoreError::InvalidFields(format!("invalid {what}: {value:?}")));
    }
    Ok(())
}

pub fn encode_value(value: &Value) -> Value {
    match value {
        Value::Null => json!({ "nullValue": null }),
        Value::Bool(b) => json!({ "booleanValue": b }),
        Value::Number(n) => match n.as_i64() {
            Some(i) => json!({ "integerValue": i.to_string() }),
            None => json!({ "doubleValue": n.as_f64().unwrap_or_default() }),
        },
        Value::String(s) => json!({ "stringValue": s }),
        Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(encode_value).collect();
            json!({ "arrayValue": { "values": values } })
        }
        Value::Object(map) => json!({ "mapValue": { "fields": encode_map(map) } }),
    }
}

fn encode_map(map: &Map<String, Value>) -> Value {
    Value::Object(
        map.iter()
            .map(|(key, value)| (key.clone(), encode_value(value)))
            .collect(),
    )
}

/// Request body for create and update calls.
pub fn encode_fields(fields: &Fields) -> Value {
    json!({ "fields": encode_map(fields) })
}

pub fn decode_value(value: &Value) -> StoreResult<Value> {
    let Some(map) = value.as_object() else {
        return Err(malformed("typed value must be an object"));
    };
    let Some((kind, inner)) = map.iter().next() else {
        return Err(malformed("typed value is empty"));
    };
    match kind.as_str() {
        "nullValue" => Ok(Value::Null),
        "booleanValue" => inner
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| malformed("booleanValue")),
        "integerValue" => {
            let parsed = match inner {
                Value::String(s) => s.parse::<i64>().ok(),
                Value::Number(n) => n.as_i64(),
                _ => None,
            };
            parsed
                .map(Value::from)
                .ok_or_else(|| malformed("integerValue"))
        }
        "doubleValue" => inner
            .as_f64()
            .map(Value::from)
            .ok_or_else(|| malformed("doubleValue")),
        "stringValue" | "timestampValue" | "referenceValue" | "bytesValue" => inner
            .as_str()
            .map(|s| Value::String(s.to_string()))
            .ok_or_else(|| malformed(kind)),
        "arrayValue" => {
            let values = match inner.get("values") {
                Some(Value::Array(items)) => items
                    .iter()
                    .map(decode_value)
                    .collect::<StoreResult<Vec<_>>>()?,
                _ => Vec::new(),
            };
            Ok(Value::Array(values))
        }
        "mapValue" => Ok(Value::Object(decode_map(inner.get("fields"))?)),
        "geoPointValue" => Ok(inner.clone()),
        other => Err(malformed(&format!("unknown value type {other}"))),
    }
}

fn decode_map(fields: Option<&Value>) -> StoreResult<Fields> {
    let mut out = Fields::new();
    if let Some(Value::Object(map)) = fields {
        for (key, value) in map {
            out.insert(key.clone(), decode_value(value)?);
        }
    }
    Ok(out)
}

fn malformed(what: &str) -> StoreError {
    StoreError::Transport(format!("malformed firestore response: {what}"))
}

#[derive(Debug, Deserialize)]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    documents: Vec<RawDocument>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

/// The document id is the final segment of the resource name.
pub fn document_id(name: &str) -> StoreResult<String> {
    name.rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| malformed("document name"))
}

fn decode_raw(raw: RawDocument) -> StoreResult<Document> {
    Ok(Document {
        id: document_id(&raw.name)?,
        fields: decode_map(raw.fields.as_ref())?,
    })
}

pub fn decode_document(value: &Value) -> StoreResult<Document> {
    let raw: RawDocument =
        serde_json::from_value(value.clone()).map_err(|err| malformed(&err.to_string()))?;
    decode_raw(raw)
}

/// One page of a list call: documents in server order plus the token for the next page.
pub fn decode_list_page(value: &Value) -> StoreResult<(Vec<Document>, Option<String>)> {
    let page: ListPage =
        serde_json::from_value(value.clone()).map_err(|err| malformed(&err.to_string()))?;
    let documents = page
        .documents
        .into_iter()
        .map(decode_raw)
        .collect::<StoreResult<Vec<_>>>()?;
    let token = page.next_page_token.filter(|token| !token.is_empty());
    Ok((documents, token))
}

/// Hands one poll result to the subscriber unless it equals the previous one. A failure
/// that keeps repeating goes out once; the first success after it always goes out.
#[cfg_attr(not(feature = "app"), allow(dead_code))]
pub(crate) fn publish_if_changed(
    tx: &SnapshotSender,
    last: &mut Option<SnapshotEvent>,
    event: SnapshotEvent,
) -> bool {
    if last.as_ref() == Some(&event) {
        return false;
    }
    tx.send_replace(Some(event.clone()));
    *last = Some(event);
    true
}

/// Query pairs for a partial update: only the named fields are written, and only when the
/// document still exists.
pub fn update_query(fields: &Fields) -> Vec<(&'static str, String)> {
    let mut query: Vec<(&'static str, String)> = fields
        .keys()
        .map(|key| ("updateMask.fieldPaths", key.clone()))
        .collect();
    query.push(("currentDocument.exists", "true".to_string()));
    query
}

/// Maps a failed HTTP exchange onto the store error taxonomy.
pub fn error_from_response(status: u16, body: &str, what: &str) -> StoreError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .map(|b| {
            if b.error.message.is_empty() {
                b.error.status
            } else {
                b.error.message
            }
        })
        .unwrap_or_else(|_| body.trim().to_string());
    let message = if detail.is_empty() {
        format!("http {status}")
    } else {
        format!("http {status}: {detail}")
    };
    match status {
        401 | 403 => StoreError::PermissionDenied(message),
        404 => StoreError::NotFound {
            collection: String::new(),
            id: what.to_string(),
        },
        400 => StoreError::InvalidFields(message),
        _ => StoreError::Transport(message),
    }
}

#[cfg(feature = "app")]
pub use client::FirestoreStore;

#[cfg(feature = "app")]
mod client {
    use std::time::Duration;

    use async_trait::async_trait;
    use reqwest::{Client, Method, RequestBuilder};
    use serde_json::Value;

    use super::*;
    use crate::models::{DocumentId, Snapshot};
    use crate::store::{snapshot_channel, DocumentStore, Subscription};

    #[derive(Clone)]
    pub struct FirestoreStore {
        client: Client,
        target: FirestoreTarget,
        poll_interval: Duration,
    }

    impl FirestoreStore {
        pub fn new(settings: &FirestoreSettings) -> StoreResult<Self> {
            let target = FirestoreTarget::from_settings(settings)?;
            let client = Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .map_err(|err| {
                    StoreError::Transport(format!("failed to build http client: {err}"))
                })?;
            log::info!(
                "firestore: endpoint={} project={} database={}",
                target.endpoint,
                target.project_id,
                target.database
            );
            Ok(Self {
                client,
                target,
                poll_interval: Duration::from_millis(settings.poll_interval_ms.max(100)),
            })
        }

        fn request(&self, method: Method, url: &str) -> RequestBuilder {
            let request = self.client.request(method, url);
            match &self.target.api_key {
                Some(key) => request.query(&[("key", key)]),
                None => request,
            }
        }

        async fn send(&self, request: RequestBuilder, what: &str) -> StoreResult<Value> {
            let resp = request
                .send()
                .await
                .map_err(|err| StoreError::Transport(format!("firestore request failed: {err}")))?;
            let status = resp.status();
            let text = resp
                .text()
                .await
                .map_err(|err| {
                    StoreError::Transport(format!("failed to read firestore response: {err}"))
                })?;
            if !status.is_success() {
                return Err(error_from_response(status.as_u16(), &text, what));
            }
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            serde_json::from_str(&text).map_err(|err| malformed(&err.to_string()))
        }

        /// Reads the whole collection, following page tokens.
        pub async fn list(&self, collection: &str) -> StoreResult<Snapshot> {
            let url = self.target.collection_url(collection)?;
            let mut documents = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let mut request = self
                    .request(Method::GET, &url)
                    .query(&[("pageSize", LIST_PAGE_SIZE.to_string())]);
                if let Some(token) = &token {
                    request = request.query(&[("pageToken", token)]);
                }
                let value = self.send(request, collection).await?;
                let (page, next) = decode_list_page(&value)?;
                documents.extend(page);
                match next {
                    Some(next) => token = Some(next),
                    None => return Ok(documents),
                }
            }
        }

        async fn poll(self, collection: String, tx: SnapshotSender) {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last: Option<SnapshotEvent> = None;
            loop {
                interval.tick().await;
                if tx.is_closed() {
                    log::debug!("firestore: subscription released collection={collection}");
                    return;
                }
                let event = self.list(&collection).await;
                if let Err(err) = &event {
                    log::warn!("firestore: poll failed collection={collection} err={err}");
                }
                publish_if_changed(&tx, &mut last, event);
            }
        }
    }

    #[async_trait]
    impl DocumentStore for FirestoreStore {
        async fn subscribe(&self, collection: &str) -> StoreResult<Subscription> {
            self.target.collection_url(collection)?;
            let (tx, rx) = snapshot_channel();
            let poller = tokio::spawn(self.clone().poll(collection.to_string(), tx));
            Ok(Subscription::with_poller(rx, poller))
        }

        async fn create(&self, collection: &str, fields: Fields) -> StoreResult<DocumentId> {
            let url = self.target.collection_url(collection)?;
            let request = self.request(Method::POST, &url).json(&encode_fields(&fields));
            let value = self.send(request, collection).await?;
            Ok(decode_document(&value)?.id)
        }

        async fn update(&self, collection: &str, id: &str, fields: Fields) -> StoreResult<()> {
            if fields.is_empty() {
                return Err(StoreError::InvalidFields("no fields given".to_string()));
            }
            let url = self.target.document_url(collection, id)?;
            let request = self
                .request(Method::PATCH, &url)
                .query(&update_query(&fields))
                .json(&encode_fields(&fields));
            self.send(request, id)
                .await
                .map_err(|err| with_collection(err, collection))?;
            Ok(())
        }

        async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
            let url = self.target.document_url(collection, id)?;
            let request = self
                .request(Method::DELETE, &url)
                .query(&[("currentDocument.exists", "true")]);
            self.send(request, id)
                .await
                .map_err(|err| with_collection(err, collection))?;
            Ok(())
        }
    }

    fn with_collection(err: StoreError, collection: &str) -> StoreError {
        match err {
            StoreError::NotFound { id, .. } => StoreError::not_found(collection, &id),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> FirestoreTarget {
        FirestoreTarget::from_settings(&FirestoreSettings {
            endpoint: "http://localhost:8080/".to_string(),
            project_id: "demo".to_string(),
            api_key: Some("  ".to_string()),
            ..FirestoreSettings::default()
        })
        .unwrap()
    }

    #[test]
    fn urls_follow_rest_layout() {
        let t = target();
        assert_eq!(t.api_key, None);
        assert_eq!(
            t.collection_url("tasks").unwrap(),
            "http://localhost:8080/v1/projects/demo/databases/(default)/documents/tasks"
        );
        assert_eq!(
            t.document_url("tasks", "abc").unwrap(),
            "http://localhost:8080/v1/projects/demo/databases/(default)/documents/tasks/abc"
        );
        assert!(t.document_url("tasks", "a/b").is_err());
        assert!(t.collection_url("").is_err());
    }

    #[test]
    fn missing_project_is_a_configuration_error() {
        assert!(matches!(
            FirestoreTarget::from_settings(&FirestoreSettings::default()),
            Err(StoreError::InvalidFields(_))
        ));
    }

    #[test]
    fn fields_encode_with_type_tags() {
        let mut fields = Fields::new();
        fields.insert("task".into(), json!("Buy milk"));
        fields.insert("status".into(), json!("due"));
        fields.insert("count".into(), json!(3));
        fields.insert("ratio".into(), json!(0.5));
        fields.insert("tags".into(), json!(["a", true, null]));
        assert_eq!(
            encode_fields(&fields),
            json!({
                "fields": {
                    "task": { "stringValue": "Buy milk" },
                    "status": { "stringValue": "due" },
                    "count": { "integerValue": "3" },
                    "ratio": { "doubleValue": 0.5 },
                    "tags": { "arrayValue": { "values": [
                        { "stringValue": "a" },
                        { "booleanValue": true },
                        { "nullValue": null }
                    ] } }
                }
            })
        );
    }

    #[test]
    fn list_page_decodes_documents_in_order() {
        let body = json!({
            "documents": [
                {
                    "name": "projects/demo/databases/(default)/documents/tasks/b1",
                    "fields": {
                        "task": { "stringValue": "Walk dog" },
                        "status": { "stringValue": "late" },
                        "meta": { "mapValue": { "fields": { "n": { "integerValue": "7" } } } },
                        "at": { "timestampValue": "2024-01-01T00:00:00Z" }
                    },
                    "createTime": "2024-01-01T00:00:00Z"
                },
                { "name": "projects/demo/databases/(default)/documents/tasks/a0" }
            ],
            "nextPageToken": "tok"
        });
        let (docs, token) = decode_list_page(&body).unwrap();
        assert_eq!(token.as_deref(), Some("tok"));
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "b1");
        assert_eq!(docs[0].fields["task"], "Walk dog");
        assert_eq!(docs[0].fields["meta"], json!({ "n": 7 }));
        assert_eq!(docs[0].fields["at"], "2024-01-01T00:00:00Z");
        assert_eq!(docs[1].id, "a0");
        assert!(docs[1].fields.is_empty());
    }

    #[test]
    fn empty_collection_decodes_to_nothing() {
        let (docs, token) = decode_list_page(&json!({})).unwrap();
        assert!(docs.is_empty());
        assert!(token.is_none());
        let (_, token) = decode_list_page(&json!({ "nextPageToken": "" })).unwrap();
        assert!(token.is_none());
    }

    #[test]
    fn malformed_values_are_transport_errors() {
        assert!(matches!(
            decode_value(&json!({ "integerValue": "x" })),
            Err(StoreError::Transport(_))
        ));
        assert!(decode_value(&json!({})).is_err());
        assert!(decode_value(&json!({ "mysteryValue": 1 })).is_err());
        assert!(document_id("projects/demo/documents/tasks/").is_err());
    }

    #[test]
    fn created_document_yields_its_id() {
        let doc = decode_document(&json!({
            "name": "projects/demo/databases/(default)/documents/tasks/xyz",
            "fields": { "status": { "stringValue": "due" } }
        }))
        .unwrap();
        assert_eq!(doc.id, "xyz");
        assert_eq!(doc.fields["status"], "due");
    }

    #[test]
    fn update_query_masks_named_fields() {
        let mut fields = Fields::new();
        fields.insert("status".into(), json!("done"));
        assert_eq!(
            update_query(&fields),
            vec![
                ("updateMask.fieldPaths", "status".to_string()),
                ("currentDocument.exists", "true".to_string())
            ]
        );
    }

    #[test]
    fn http_errors_map_onto_taxonomy() {
        let body = json!({
            "error": {
                "code": 403,
                "message": "Missing or insufficient permissions.",
                "status": "PERMISSION_DENIED"
            }
        })
        .to_string();
        assert_eq!(
            error_from_response(403, &body, "tasks"),
            StoreError::PermissionDenied("http 403: Missing or insufficient permissions.".into())
        );
        assert!(matches!(
            error_from_response(404, "", "abc"),
            StoreError::NotFound { ref id, .. } if id == "abc"
        ));
        assert!(matches!(
            error_from_response(400, "bad", "x"),
            StoreError::InvalidFields(_)
        ));
        assert_eq!(
            error_from_response(503, "", "x"),
            StoreError::Transport("http 503".into())
        );
    }

    fn doc(id: &str) -> Document {
        Document {
            id: id.to_string(),
            fields: crate::models::TaskFields::new(id).into_fields(),
        }
    }

    #[test]
    fn unchanged_poll_results_are_not_republished() {
        let (tx, mut rx) = crate::store::snapshot_channel();
        let mut last = None;
        assert!(publish_if_changed(&tx, &mut last, Ok(vec![doc("a")])));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        assert!(!publish_if_changed(&tx, &mut last, Ok(vec![doc("a")])));
        assert!(!rx.has_changed().unwrap());

        assert!(publish_if_changed(&tx, &mut last, Ok(vec![doc("a"), doc("b")])));
        assert_eq!(
            rx.borrow_and_update().clone(),
            Some(Ok(vec![doc("a"), doc("b")]))
        );
    }

    #[test]
    fn failed_poll_is_reported_once_and_recovery_republishes() {
        let (tx, mut rx) = crate::store::snapshot_channel();
        let mut last = None;
        let offline = StoreError::Transport("http 503".into());
        publish_if_changed(&tx, &mut last, Ok(vec![doc("a")]));
        rx.borrow_and_update();

        assert!(publish_if_changed(&tx, &mut last, Err(offline.clone())));
        assert_eq!(rx.borrow_and_update().clone(), Some(Err(offline.clone())));
        assert!(!publish_if_changed(&tx, &mut last, Err(offline.clone())));
        assert!(!rx.has_changed().unwrap());

        // Same documents as before the outage still count as news.
        assert!(publish_if_changed(&tx, &mut last, Ok(vec![doc("a")])));
        assert_eq!(rx.borrow_and_update().clone(), Some(Ok(vec![doc("a")])));
    }
}
