//! In-memory CRM backend used to exercise the dispatcher over real HTTP.
//!
//! Everything lives under `/rest/v10`. Non-auth routes demand a live
//! `OAuth-Token`; `POST /_control/expire` revokes every access token so a
//! test can force the refresh path. `POST /bulk` replays each item through
//! the same router and wraps the answers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Path, State},
    http::{HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::{net::TcpListener, sync::RwLock};
use tower::ServiceExt;
use tracing::{debug, info};
use uuid::Uuid;

pub const API_ROOT: &str = "/rest/v10";
pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "asdf";
pub const METADATA_HASH: &str = "5a3b0c9d";

const TOKEN_HEADER: &str = "oauth-token";

#[derive(Debug, Default)]
pub struct Backend {
    access_tokens: HashSet<String>,
    refresh_tokens: HashSet<String>,
    records: HashMap<String, Vec<Map<String, Value>>>,
}

impl Backend {
    fn issue(&mut self) -> TokenGrant {
        let grant = TokenGrant {
            access_token: Uuid::new_v4().to_string(),
            expires_in: 3600,
            token_type: "bearer".to_string(),
            refresh_token: Uuid::new_v4().to_string(),
            refresh_expires_in: 1_209_600,
            download_token: Uuid::new_v4().to_string(),
        };
        self.access_tokens.insert(grant.access_token.clone());
        self.refresh_tokens.insert(grant.refresh_token.clone());
        grant
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<String, Failure> {
        match headers.get(TOKEN_HEADER).and_then(|v| v.to_str().ok()) {
            Some(token) if self.access_tokens.contains(token) => Ok(token.to_string()),
            _ => Err(Failure::invalid_grant(
                StatusCode::UNAUTHORIZED,
                "The access token provided is invalid.",
            )),
        }
    }

    fn find(&self, module: &str, id: &str) -> Option<&Map<String, Value>> {
        self.records
            .get(module)?
            .iter()
            .find(|r| r.get("id").and_then(Value::as_str) == Some(id))
    }
}

pub type Db = Arc<RwLock<Backend>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    pub expires_in: u64,
    pub token_type: String,
    pub refresh_token: String,
    pub refresh_expires_in: u64,
    pub download_token: String,
}

#[derive(Debug, Deserialize)]
pub struct TokenRequest {
    pub grant_type: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkRequest {
    pub requests: Vec<BulkItem>,
}

#[derive(Debug, Deserialize)]
pub struct BulkItem {
    /// Version-relative url such as `/v10/Accounts/1`.
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON-encoded body text.
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkReply {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub contents: Value,
}

/// Error body in the backend's `{error, error_message}` shape.
#[derive(Debug)]
pub struct Failure {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl Failure {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_grant(status: StatusCode, message: impl Into<String>) -> Self {
        Self::new(status, "invalid_grant", message)
    }

    fn not_found(module: &str, id: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Could not find record: {id} in module: {module}"),
        )
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let body = json!({ "error": self.code, "error_message": self.message });
        (self.status, Json(body)).into_response()
    }
}

pub fn app() -> Router {
    routes(Db::default())
}

fn routes(db: Db) -> Router {
    let api = Router::new()
        .route("/oauth2/token", post(token))
        .route("/oauth2/logout", post(logout))
        .route("/me", get(me))
        .route("/metadata", get(metadata))
        .route("/bulk", post(bulk))
        .route("/_control/expire", post(expire))
        .route("/{module}", get(list_records).post(create_record))
        .route(
            "/{module}/{id}",
            get(get_record).put(update_record).delete(delete_record),
        )
        .with_state(db);
    Router::new().nest(API_ROOT, api)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "mock CRM listening");
    }
    axum::serve(listener, app()).await
}

// --- auth ---

async fn token(
    State(db): State<Db>,
    Json(input): Json<TokenRequest>,
) -> Result<Json<TokenGrant>, Failure> {
    let mut backend = db.write().await;
    match input.grant_type.as_str() {
        "password" => {
            if input.username.as_deref() != Some(USERNAME) || input.password.as_deref() != Some(PASSWORD) {
                return Err(Failure::new(
                    StatusCode::UNAUTHORIZED,
                    "need_login",
                    "You must specify a valid username and password.",
                ));
            }
            debug!(client_id = ?input.client_id, platform = ?input.platform, "password grant");
            Ok(Json(backend.issue()))
        }
        "refresh_token" => {
            let presented = input.refresh_token.unwrap_or_default();
            if !backend.refresh_tokens.remove(&presented) {
                return Err(Failure::invalid_grant(StatusCode::BAD_REQUEST, "Invalid refresh token"));
            }
            debug!("refresh grant");
            Ok(Json(backend.issue()))
        }
        other => Err(Failure::new(
            StatusCode::BAD_REQUEST,
            "unsupported_grant_type",
            format!("Unsupported grant type: {other}"),
        )),
    }
}

async fn logout(State(db): State<Db>, headers: HeaderMap) -> Result<Json<Value>, Failure> {
    let mut backend = db.write().await;
    let token = backend.authorize(&headers)?;
    backend.access_tokens.remove(&token);
    Ok(Json(json!({ "success": true })))
}

async fn expire(State(db): State<Db>) -> Json<Value> {
    let mut backend = db.write().await;
    let expired = backend.access_tokens.len();
    backend.access_tokens.clear();
    info!(expired, "expired access tokens");
    Json(json!({ "expired": expired }))
}

// --- session ---

async fn me(State(db): State<Db>, headers: HeaderMap) -> Result<Json<Value>, Failure> {
    db.read().await.authorize(&headers)?;
    Ok(Json(json!({
        "current_user": { "id": "1", "user_name": USERNAME, "type": "user" }
    })))
}

async fn metadata(State(db): State<Db>, headers: HeaderMap) -> Result<Json<Value>, Failure> {
    db.read().await.authorize(&headers)?;
    Ok(Json(json!({
        "_hash": METADATA_HASH,
        "server_info": { "flavor": "ENT", "version": "mock" }
    })))
}

// --- records ---

async fn list_records(
    State(db): State<Db>,
    headers: HeaderMap,
    Path(module): Path<String>,
) -> Result<Json<Value>, Failure> {
    let backend = db.read().await;
    backend.authorize(&headers)?;
    let records = backend.records.get(&module).cloned().unwrap_or_default();
    Ok(Json(json!({ "next_offset": -1, "records": records })))
}

async fn create_record(
    State(db): State<Db>,
    headers: HeaderMap,
    Path(module): Path<String>,
    Json(mut fields): Json<Map<String, Value>>,
) -> Result<Json<Map<String, Value>>, Failure> {
    let mut backend = db.write().await;
    backend.authorize(&headers)?;
    fields.insert("id".to_string(), Value::String(Uuid::new_v4().to_string()));
    fields.insert("_module".to_string(), Value::String(module.clone()));
    backend.records.entry(module).or_default().push(fields.clone());
    Ok(Json(fields))
}

async fn get_record(
    State(db): State<Db>,
    headers: HeaderMap,
    Path((module, id)): Path<(String, String)>,
) -> Result<Json<Map<String, Value>>, Failure> {
    let backend = db.read().await;
    backend.authorize(&headers)?;
    backend
        .find(&module, &id)
        .cloned()
        .map(Json)
        .ok_or_else(|| Failure::not_found(&module, &id))
}

async fn update_record(
    State(db): State<Db>,
    headers: HeaderMap,
    Path((module, id)): Path<(String, String)>,
    Json(fields): Json<Map<String, Value>>,
) -> Result<Json<Map<String, Value>>, Failure> {
    let mut backend = db.write().await;
    backend.authorize(&headers)?;
    let record = backend
        .records
        .get_mut(&module)
        .and_then(|records| {
            records
                .iter_mut()
                .find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str()))
        })
        .ok_or_else(|| Failure::not_found(&module, &id))?;
    for (key, value) in fields {
        if key != "id" {
            record.insert(key, value);
        }
    }
    Ok(Json(record.clone()))
}

async fn delete_record(
    State(db): State<Db>,
    headers: HeaderMap,
    Path((module, id)): Path<(String, String)>,
) -> Result<Json<Value>, Failure> {
    let mut backend = db.write().await;
    backend.authorize(&headers)?;
    let records = backend.records.entry(module.clone()).or_default();
    let before = records.len();
    records.retain(|r| r.get("id").and_then(Value::as_str) != Some(id.as_str()));
    if records.len() == before {
        return Err(Failure::not_found(&module, &id));
    }
    Ok(Json(json!({ "id": id })))
}

// --- bulk ---

/// Items carry their own headers; the envelope itself is not authorized.
async fn bulk(
    State(db): State<Db>,
    Json(input): Json<BulkRequest>,
) -> Result<Json<Vec<BulkReply>>, Failure> {
    let router = routes(db);
    let mut replies = Vec::with_capacity(input.requests.len());
    for item in input.requests {
        replies.push(dispatch_item(router.clone(), item).await?);
    }
    debug!(items = replies.len(), "bulk request served");
    Ok(Json(replies))
}

async fn dispatch_item(router: Router, item: BulkItem) -> Result<BulkReply, Failure> {
    let method = Method::from_bytes(item.method.as_bytes()).map_err(|_| {
        Failure::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            format!("Invalid bulk method: {}", item.method),
        )
    })?;
    let mut builder = Request::builder().method(method).uri(format!("/rest{}", item.url));
    for (name, value) in &item.headers {
        builder = builder.header(name, value);
    }
    let body = item.data.map(Body::from).unwrap_or_else(Body::empty);
    let request = builder
        .body(body)
        .map_err(|e| Failure::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))?;

    let response = router
        .oneshot(request)
        .await
        .unwrap_or_else(|never| match never {});
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .map_err(|e| Failure::new(StatusCode::INTERNAL_SERVER_ERROR, "bulk_error", e.to_string()))?;
    let contents = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

    Ok(BulkReply {
        status,
        headers,
        contents,
    })
}
