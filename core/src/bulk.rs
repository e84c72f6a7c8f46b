//! Batching of several calls into one `POST {server}/bulk` exchange.
//!
//! # Design
//! Queued items keep their own `PendingRequest`; the batch only records ids
//! in enqueue order. When the batch request executes, each item is executed
//! in turn to produce its transport request, which is folded into the batch
//! body with a version-relative url. The combined response is split back
//! into one `TransportOutcome` per item, in the same order.

use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::http::{Body, HttpRequest, HttpResponse, TransportOutcome};
use crate::request::RequestId;
use crate::url::version_relative;

/// Batches waiting for a flush, keyed by batch id.
#[derive(Debug, Default)]
pub(crate) struct BulkQueue {
    batches: HashMap<String, Vec<RequestId>>,
}

impl BulkQueue {
    pub fn enqueue(&mut self, batch_id: &str, id: RequestId) {
        self.batches.entry(batch_id.to_string()).or_default().push(id);
    }

    pub fn take(&mut self, batch_id: &str) -> Vec<RequestId> {
        self.batches.remove(batch_id).unwrap_or_default()
    }

    pub fn remove(&mut self, id: RequestId) {
        for items in self.batches.values_mut() {
            items.retain(|queued| *queued != id);
        }
    }

    pub fn len(&self, batch_id: &str) -> usize {
        self.batches.get(batch_id).map_or(0, Vec::len)
    }
}

/// One entry of the batch body.
pub(crate) fn bulk_item(request: &HttpRequest) -> Value {
    let headers: Map<String, Value> = request
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    let mut item = json!({
        "url": version_relative(&request.url),
        "method": request.method.as_str(),
        "headers": headers,
    });
    if let Some(Body::Json(data)) = &request.body {
        item["data"] = Value::String(data.clone());
    }
    item
}

pub(crate) fn bulk_body(items: Vec<Value>) -> Value {
    json!({ "requests": items })
}

/// Split a batch response into `count` per-item outcomes.
///
/// A response that is not an array yields a parse failure for every item;
/// a short array pads the missing tail the same way.
pub(crate) fn demultiplex(response: &HttpResponse, count: usize) -> Vec<TransportOutcome> {
    let entries = match serde_json::from_str::<Value>(&response.body) {
        Ok(Value::Array(entries)) => entries,
        _ => Vec::new(),
    };

    let mut outcomes: Vec<TransportOutcome> = entries.iter().take(count).map(item_outcome).collect();
    while outcomes.len() < count {
        outcomes.push(TransportOutcome::NetworkFailure {
            text_status: "parsererror".to_string(),
            error: "bulk response is missing this item".to_string(),
        });
    }
    outcomes
}

fn item_outcome(entry: &Value) -> TransportOutcome {
    let status = entry
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(0);

    let mut headers: Vec<(String, String)> = match entry.get("headers") {
        Some(Value::Object(map)) => map
            .iter()
            .map(|(k, v)| {
                let value = v.as_str().map_or_else(|| v.to_string(), str::to_string);
                (k.clone(), value)
            })
            .collect(),
        _ => Vec::new(),
    };

    let body = match entry.get("contents") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => {
            if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
            }
            other.to_string()
        }
    };

    TransportOutcome::Response(HttpResponse { status, headers, body })
}
