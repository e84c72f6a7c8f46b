use axum::http::{self, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use mock_server::{app, BulkReply, TokenGrant, METADATA_HASH, PASSWORD, USERNAME};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: axum::response::Response) -> bytes::Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

fn json_request(method: &str, uri: &str, token: Option<&str>, body: &str) -> Request<String> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header("OAuth-Token", token);
    }
    builder.body(body.to_string()).unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<String> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("OAuth-Token", token);
    }
    builder.body(String::new()).unwrap()
}

async fn login(app: &Router) -> TokenGrant {
    let body = json!({
        "grant_type": "password",
        "username": USERNAME,
        "password": PASSWORD,
        "client_id": "sugar",
        "client_secret": "",
        "platform": "base"
    });
    let resp = app
        .clone()
        .oneshot(json_request("POST", "/rest/v10/oauth2/token", None, &body.to_string()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    body_json(resp).await
}

// --- token endpoint ---

#[tokio::test]
async fn password_grant_issues_three_tokens() {
    let app = app();
    let grant = login(&app).await;
    assert!(!grant.access_token.is_empty());
    assert!(!grant.refresh_token.is_empty());
    assert!(!grant.download_token.is_empty());
    assert_eq!(grant.token_type, "bearer");
}

#[tokio::test]
async fn wrong_password_is_need_login() {
    let app = app();
    let body = r#"{"grant_type":"password","username":"admin","password":"nope"}"#;
    let resp = app
        .oneshot(json_request("POST", "/rest/v10/oauth2/token", None, body))
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let err: Value = body_json(resp).await;
    assert_eq!(err["error"], "need_login");
}

#[tokio::test]
async fn refresh_token_is_single_use() {
    let app = app();
    let grant = login(&app).await;
    let body = json!({"grant_type": "refresh_token", "refresh_token": grant.refresh_token}).to_string();

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/rest/v10/oauth2/token", None, &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let refreshed: TokenGrant = body_json(resp).await;
    assert_ne!(refreshed.access_token, grant.access_token);

    let resp = app
        .oneshot(json_request("POST", "/rest/v10/oauth2/token", None, &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err: Value = body_json(resp).await;
    assert_eq!(err["error"], "invalid_grant");
}

#[tokio::test]
async fn unknown_grant_type_is_rejected() {
    let app = app();
    let resp = app
        .oneshot(json_request(
            "POST",
            "/rest/v10/oauth2/token",
            None,
            r#"{"grant_type":"client_credentials"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let err: Value = body_json(resp).await;
    assert_eq!(err["error"], "unsupported_grant_type");
}

// --- authorization ---

#[tokio::test]
async fn missing_token_is_invalid_grant() {
    let app = app();
    let resp = app.oneshot(get_request("/rest/v10/me", None)).await.unwrap();

    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let err: Value = body_json(resp).await;
    assert_eq!(err["error"], "invalid_grant");
    assert!(err["error_message"].as_str().unwrap().contains("invalid"));
}

#[tokio::test]
async fn expire_revokes_access_but_not_refresh() {
    let app = app();
    let grant = login(&app).await;

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/rest/v10/_control/expire", None, "{}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let expired: Value = body_json(resp).await;
    assert_eq!(expired["expired"], 1);

    let resp = app
        .clone()
        .oneshot(get_request("/rest/v10/me", Some(&grant.access_token)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body = json!({"grant_type": "refresh_token", "refresh_token": grant.refresh_token}).to_string();
    let resp = app
        .oneshot(json_request("POST", "/rest/v10/oauth2/token", None, &body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn logout_revokes_the_token() {
    let app = app();
    let grant = login(&app).await;
    let token = Some(grant.access_token.as_str());

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/rest/v10/oauth2/logout", token, "{}"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get_request("/rest/v10/me", token)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

// --- session ---

#[tokio::test]
async fn me_and_metadata() {
    let app = app();
    let grant = login(&app).await;
    let token = Some(grant.access_token.as_str());

    let resp = app.clone().oneshot(get_request("/rest/v10/me", token)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let me: Value = body_json(resp).await;
    assert_eq!(me["current_user"]["user_name"], USERNAME);

    let resp = app
        .oneshot(get_request("/rest/v10/metadata?type_filter=modules", token))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let metadata: Value = body_json(resp).await;
    assert_eq!(metadata["_hash"], METADATA_HASH);
}

// --- records ---

#[tokio::test]
async fn record_lifecycle() {
    let app = app();
    let grant = login(&app).await;
    let token = Some(grant.access_token.as_str());

    let resp = app
        .clone()
        .oneshot(json_request("POST", "/rest/v10/Accounts", token, r#"{"name":"Acme"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let created: Value = body_json(resp).await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["name"], "Acme");
    assert_eq!(created["_module"], "Accounts");

    let uri = format!("/rest/v10/Accounts/{id}");
    let resp = app
        .clone()
        .oneshot(json_request("PUT", &uri, token, r#"{"name":"Acme Corp","id":"ignored"}"#))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let updated: Value = body_json(resp).await;
    assert_eq!(updated["name"], "Acme Corp");
    assert_eq!(updated["id"], id.as_str());

    let resp = app.clone().oneshot(get_request("/rest/v10/Accounts", token)).await.unwrap();
    let list: Value = body_json(resp).await;
    assert_eq!(list["records"].as_array().unwrap().len(), 1);

    let resp = app
        .clone()
        .oneshot(json_request("DELETE", &uri, token, ""))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = app.oneshot(get_request(&uri, token)).await.unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let err: Value = body_json(resp).await;
    assert_eq!(err["error"], "not_found");
}

#[tokio::test]
async fn update_missing_record_returns_404() {
    let app = app();
    let grant = login(&app).await;
    let resp = app
        .oneshot(json_request(
            "PUT",
            "/rest/v10/Accounts/missing",
            Some(&grant.access_token),
            r#"{"name":"x"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn create_non_object_body_returns_422() {
    let app = app();
    let grant = login(&app).await;
    let resp = app
        .oneshot(json_request("POST", "/rest/v10/Accounts", Some(&grant.access_token), "[1,2]"))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(!body_bytes(resp).await.is_empty());
}

// --- bulk ---

#[tokio::test]
async fn bulk_replays_each_item_with_its_own_headers() {
    let app = app();
    let grant = login(&app).await;
    let body = json!({
        "requests": [
            {
                "url": "/v10/Accounts",
                "method": "POST",
                "headers": {"OAuth-Token": grant.access_token, "Content-Type": "application/json"},
                "data": r#"{"name":"Bulk Co"}"#
            },
            {
                "url": "/v10/me",
                "method": "GET",
                "headers": {"OAuth-Token": "stale"}
            },
            {
                "url": "/v10/Accounts/none",
                "method": "GET",
                "headers": {"OAuth-Token": grant.access_token}
            }
        ]
    });

    let resp = app
        .oneshot(json_request("POST", "/rest/v10/bulk", None, &body.to_string()))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let replies: Vec<BulkReply> = body_json(resp).await;
    assert_eq!(replies.len(), 3);
    assert_eq!(replies[0].status, 200);
    assert_eq!(replies[0].contents["name"], "Bulk Co");
    assert_eq!(replies[1].status, 401);
    assert_eq!(replies[1].contents["error"], "invalid_grant");
    assert_eq!(replies[2].status, 404);
}

#[tokio::test]
async fn bulk_rejects_invalid_method() {
    let app = app();
    let body = r#"{"requests":[{"url":"/v10/me","method":"NOT A METHOD"}]}"#;
    let resp = app
        .oneshot(json_request("POST", "/rest/v10/bulk", None, body))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}
