//! End-to-end tests over the router, driven with `tower::ServiceExt`.

use agblogger_server::{AppState, ServerSettings, build_router};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tempfile::TempDir;
use tower::ServiceExt;

struct TestServer {
    _content: TempDir,
    app: Router,
    state: AppState,
}

async fn test_server() -> TestServer {
    let content = TempDir::new().expect("tempdir");
    let settings = ServerSettings::for_tests(content.path().to_path_buf());
    let state = AppState::initialize(settings).await.expect("initialize");

    // Seed one admin directly; bcrypt cost 4 keeps the tests quick.
    {
        let conn = state.db.lock().await;
        agblogger_auth::create_user(
            &conn,
            &agblogger_auth::NewUser {
                username: "admin".into(),
                email: "admin@example.com".into(),
                password_hash: bcrypt::hash("correct horse", 4).expect("hash"),
                display_name: None,
                is_admin: true,
            },
        )
        .expect("seed admin");
    }

    let app = build_router(state.clone());
    TestServer { _content: content, app, state }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value, Vec<String>) {
    let response = app.clone().oneshot(request).await.expect("request");
    let status = response.status();
    let cookies = response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect();
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).into_owned(),
        ))
    };
    (status, body, cookies)
}

fn json_request(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

/// Log in and mint a PAT for header-authenticated calls.
async fn admin_pat(server: &TestServer) -> String {
    let (status, body, _) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/login",
            &json!({ "username": "admin", "password": "correct horse" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    let access = body["access_token"].as_str().expect("access token").to_string();

    let request = Request::builder()
        .method("POST")
        .uri("/auth/tokens")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {access}"))
        .body(Body::from(json!({ "label": "tests" }).to_string()))
        .expect("request");
    let (status, body, _) = send(&server.app, request).await;
    assert_eq!(status, StatusCode::OK, "pat mint failed: {body}");
    body["token"].as_str().expect("pat").to_string()
}

fn bearer(request: Request<Body>, token: &str) -> Request<Body> {
    let (mut parts, body) = request.into_parts();
    parts.headers.insert(
        header::AUTHORIZATION,
        format!("Bearer {token}").parse().expect("header"),
    );
    Request::from_parts(parts, body)
}

#[tokio::test]
async fn healthz_is_public() {
    let server = test_server().await;
    let (status, body, _) = send(&server.app, get_request("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn login_rejects_bad_password_and_rate_limits() {
    let server = test_server().await;

    for attempt in 0..5 {
        let (status, _, _) = send(
            &server.app,
            json_request(
                "POST",
                "/auth/login",
                &json!({ "username": "admin", "password": "wrong" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "attempt {attempt}");
    }

    // The breach response carries retry_after.
    let (status, body, _) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/login",
            &json!({ "username": "admin", "password": "wrong" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["retry_after"].as_u64().is_some());

    // Unknown users answer exactly like wrong passwords.
    let (status, _, _) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/login",
            &json!({ "username": "nobody", "password": "x" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn login_sets_session_cookies() {
    let server = test_server().await;
    let (status, body, cookies) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/login",
            &json!({ "username": "admin", "password": "correct horse" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["is_admin"].as_bool().expect("is_admin"));
    assert!(cookies.iter().any(|c| c.starts_with("access_token=") && c.contains("HttpOnly")));
    assert!(cookies.iter().any(|c| c.starts_with("csrf_token=") && !c.contains("HttpOnly")));
    assert!(cookies.iter().any(|c| c.contains("SameSite=Strict")));
}

#[tokio::test]
async fn cookie_mutations_require_csrf_header() {
    let server = test_server().await;
    let (_, body, cookies) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/login",
            &json!({ "username": "admin", "password": "correct horse" }),
        ),
    )
    .await;
    let csrf = body["csrf_token"].as_str().expect("csrf").to_string();
    let cookie_header = cookies
        .iter()
        .map(|c| c.split(';').next().unwrap_or(""))
        .collect::<Vec<_>>()
        .join("; ");

    let post_body = json!({ "path": "csrf-test.md", "body": "# T\n" });

    // Cookie auth without the header: rejected.
    let request = Request::builder()
        .method("POST")
        .uri("/posts")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, cookie_header.clone())
        .body(Body::from(post_body.to_string()))
        .expect("request");
    let (status, _, _) = send(&server.app, request).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Same request with the double-submit header: accepted.
    let request = Request::builder()
        .method("POST")
        .uri("/posts")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::COOKIE, cookie_header)
        .header("x-csrf-token", csrf)
        .body(Body::from(post_body.to_string()))
        .expect("request");
    let (status, body, _) = send(&server.app, request).await;
    assert_eq!(status, StatusCode::OK, "create failed: {body}");
}

#[tokio::test]
async fn post_crud_and_draft_visibility() {
    let server = test_server().await;
    let pat = admin_pat(&server).await;

    // Create a draft.
    let (status, body, _) = send(
        &server.app,
        bearer(
            json_request(
                "POST",
                "/posts",
                &json!({ "path": "hidden.md", "body": "# Hidden\n\nsecret\n", "draft": true }),
            ),
            &pat,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "create: {body}");
    assert_eq!(body["post"]["is_draft"], json!(true));

    // Unauthenticated raw access: 404, not 403, to avoid existence leaks.
    let (status, _, _) = send(&server.app, get_request("/posts/hidden.md/raw")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Admin sees it.
    let (status, body, _) =
        send(&server.app, bearer(get_request("/posts/hidden.md/raw"), &pat)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().expect("markdown").contains("secret"));

    // Not listed publicly; listed for the admin.
    let (_, body, _) = send(&server.app, get_request("/posts")).await;
    assert_eq!(body["total"], json!(0));
    let (_, body, _) = send(&server.app, bearer(get_request("/posts"), &pat)).await;
    assert_eq!(body["total"], json!(1));

    // Duplicate create conflicts.
    let (status, _, _) = send(
        &server.app,
        bearer(
            json_request(
                "POST",
                "/posts",
                &json!({ "path": "hidden.md", "body": "# Again\n" }),
            ),
            &pat,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Delete.
    let request = bearer(
        Request::builder()
            .method("DELETE")
            .uri("/posts/hidden.md")
            .body(Body::empty())
            .expect("request"),
        &pat,
    );
    let (status, _, _) = send(&server.app, request).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body, _) = send(&server.app, bearer(get_request("/posts"), &pat)).await;
    assert_eq!(body["total"], json!(0));
}

#[tokio::test]
async fn label_cycle_returns_conflict_and_changes_nothing() {
    let server = test_server().await;
    let pat = admin_pat(&server).await;

    for (id, parents) in [("c", json!([])), ("b", json!(["c"])), ("a", json!(["b"]))] {
        let (status, body, _) = send(
            &server.app,
            bearer(
                json_request("POST", "/labels", &json!({ "id": id, "parents": parents })),
                &pat,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "label {id}: {body}");
    }

    let labels_toml_before =
        std::fs::read_to_string(server.state.store.root().join("labels.toml")).expect("toml");

    // c -> a closes the cycle a -> b -> c.
    let (status, body, _) = send(
        &server.app,
        bearer(
            json_request("PUT", "/labels/c", &json!({ "parents": ["a"] })),
            &pat,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    let message = body["message"].as_str().expect("message");
    assert!(message.contains("c -> a"), "offending edge not named: {message}");

    // Neither the TOML nor the cache changed.
    let labels_toml_after =
        std::fs::read_to_string(server.state.store.root().join("labels.toml")).expect("toml");
    assert_eq!(labels_toml_before, labels_toml_after);
    let (_, body, _) = send(&server.app, get_request("/labels/c")).await;
    assert_eq!(body["label"]["parents"], json!([]));

    let (_, body, _) = send(&server.app, get_request("/labels/graph")).await;
    assert_eq!(body["edges"].as_array().expect("edges").len(), 2);
}

#[tokio::test]
async fn label_filtering_includes_descendants() {
    let server = test_server().await;
    let pat = admin_pat(&server).await;

    for (id, parents) in [("tech", json!([])), ("rust", json!(["tech"]))] {
        let (status, _, _) = send(
            &server.app,
            bearer(
                json_request("POST", "/labels", &json!({ "id": id, "parents": parents })),
                &pat,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, _) = send(
        &server.app,
        bearer(
            json_request(
                "POST",
                "/posts",
                &json!({ "path": "rusty.md", "body": "# R\n", "labels": ["rust"] }),
            ),
            &pat,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body, _) = send(&server.app, get_request("/labels/tech/posts")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], json!(1));
    assert_eq!(body["posts"][0]["file_path"], json!("posts/rusty.md"));
}

#[tokio::test]
async fn sync_surface_requires_admin_and_plans_first_sync() {
    let server = test_server().await;
    let pat = admin_pat(&server).await;

    // Unauthenticated: 401.
    let (status, _, _) = send(
        &server.app,
        json_request("POST", "/sync/init", &json!({ "manifest": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Seed two posts through the API so the server has content + commits.
    for name in ["a", "b"] {
        let (status, _, _) = send(
            &server.app,
            bearer(
                json_request(
                    "POST",
                    "/posts",
                    &json!({ "path": format!("{name}.md"), "body": format!("# {name}\n") }),
                ),
                &pat,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    // Empty client manifest: everything is a download.
    let (status, body, _) = send(
        &server.app,
        bearer(json_request("POST", "/sync/init", &json!({ "manifest": {} })), &pat),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "init: {body}");
    let downloads = body["download"].as_array().expect("download");
    let paths: Vec<&str> = downloads.iter().filter_map(|v| v.as_str()).collect();
    assert!(paths.contains(&"posts/a.md"));
    assert!(paths.contains(&"posts/b.md"));
    assert!(body["server_commit"].as_str().is_some());

    // Download works and path traversal is rejected.
    let (status, body, _) = send(
        &server.app,
        bearer(get_request("/sync/download/posts/a.md"), &pat),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_str().expect("body").contains("# a"));

    let (status, _, _) = send(
        &server.app,
        bearer(get_request("/sync/download/.git/HEAD"), &pat),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Empty commit succeeds and reports the HEAD.
    let (status, body, _) = send(
        &server.app,
        bearer(json_request("POST", "/sync/commit", &json!({})), &pat),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
    assert!(body["commit"].as_str().is_some());
}

#[tokio::test]
async fn render_preview_unavailable_without_engine() {
    let server = test_server().await;
    let pat = admin_pat(&server).await;

    let (status, body, _) = send(
        &server.app,
        bearer(
            json_request("POST", "/render/preview", &json!({ "markdown": "# Hi" })),
            &pat,
        ),
    )
    .await;
    // No engine is installed in the test environment: one restart attempt,
    // then 502.
    assert_eq!(status, StatusCode::BAD_GATEWAY, "{body}");
    assert_eq!(body["error"], json!("render_unavailable"));
}

#[tokio::test]
async fn registration_is_invite_gated() {
    let server = test_server().await;
    let pat = admin_pat(&server).await;

    // Bogus invite: 400.
    let (status, _, _) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/register",
            &json!({
                "invite_code": "bogus",
                "username": "eve",
                "email": "eve@example.com",
                "password": "longenough",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Real invite: registered as non-admin.
    let (status, body, _) = send(
        &server.app,
        bearer(json_request("POST", "/auth/invites", &json!({})), &pat),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let code = body["invite_code"].as_str().expect("code").to_string();

    let (status, body, _) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/register",
            &json!({
                "invite_code": code.clone(),
                "username": "bob",
                "email": "bob@example.com",
                "password": "longenough",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "register: {body}");
    assert_eq!(body["is_admin"], json!(false));

    // The invite is single-use.
    let (status, _, _) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/register",
            &json!({
                "invite_code": code,
                "username": "mallory",
                "email": "m@example.com",
                "password": "longenough",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn refresh_rotates_and_revokes() {
    let server = test_server().await;
    let (_, body, _) = send(
        &server.app,
        json_request(
            "POST",
            "/auth/login",
            &json!({ "username": "admin", "password": "correct horse" }),
        ),
    )
    .await;
    let first = body["refresh_token"].as_str().expect("refresh").to_string();

    let (status, body, _) = send(
        &server.app,
        json_request("POST", "/auth/refresh", &json!({ "refresh_token": first })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let second = body["refresh_token"].as_str().expect("rotated").to_string();
    assert_ne!(first, second);

    // The first token is dead.
    let (status, _, _) = send(
        &server.app,
        json_request("POST", "/auth/refresh", &json!({ "refresh_token": first })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unsafe_post_paths_rejected() {
    let server = test_server().await;
    let pat = admin_pat(&server).await;

    for path in ["../outside.md", "a/../../b.md", ".git/config"] {
        let (status, _, _) = send(
            &server.app,
            bearer(
                json_request("POST", "/posts", &json!({ "path": path, "body": "x" })),
                &pat,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "accepted {path}");
    }
}
