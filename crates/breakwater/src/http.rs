//! The REST surface: a thin request-to-verdict adapter over axum.

use crate::auth::AccessControl;
use crate::tuple::LoginTuple;
use crate::verdict::Verdict;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, RwLock};

/// An adapter-registered custom command under `/command/<name>`.
pub type CustomFunc = Arc<dyn Fn(&serde_json::Value) -> serde_json::Value + Send + Sync>;

pub struct App {
    pub verdict: Verdict,
    pub access: AccessControl,
    custom: RwLock<HashMap<String, CustomFunc>>,
}

impl App {
    pub fn new(verdict: Verdict, access: AccessControl) -> App {
        App {
            verdict,
            access,
            custom: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_custom_endpoint(&self, name: &str, f: CustomFunc) {
        self.custom.write().unwrap().insert(name.to_string(), f);
    }
}

pub fn build_router(app: Arc<App>) -> Router {
    Router::new()
        .route("/", post(command))
        .route("/command/{name}", post(custom_command))
        .route("/metrics", get(metrics))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app)
}

#[derive(Deserialize)]
struct CommandQuery {
    command: String,
}

#[derive(Deserialize)]
struct ResetRequest {
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    ip: Option<IpAddr>,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"breakwater\"")],
        Json(json!({"status": "failure", "reason": "unauthorized"})),
    )
        .into_response()
}

fn bad_request(reason: String) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"status": "failure", "reason": reason})),
    )
        .into_response()
}

fn authorize(app: &App, addr: &SocketAddr, headers: &HeaderMap) -> Result<(), Response> {
    if !app.access.addr_allowed(&addr.ip()) {
        tracing::warn!(client = %addr, "request from address outside the ACL");
        return Err(unauthorized());
    }
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !app.access.credentials_ok(authorization) {
        return Err(unauthorized());
    }
    Ok(())
}

async fn command(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<CommandQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(response) = authorize(&app, &addr, &headers) {
        return response;
    }
    let timer = ops::metrics::COMMAND_DURATION.start_timer();

    let response = match query.command.as_str() {
        "report" => match serde_json::from_str::<LoginTuple>(&body) {
            Ok(tuple) => {
                app.verdict.report(&tuple);
                Json(json!({"status": "ok"})).into_response()
            }
            Err(err) => bad_request(err.to_string()),
        },
        "allow" => match serde_json::from_str::<LoginTuple>(&body) {
            Ok(tuple) => Json(app.verdict.allow(&tuple)).into_response(),
            Err(err) => bad_request(err.to_string()),
        },
        "reset" => match serde_json::from_str::<ResetRequest>(&body) {
            Ok(req) if req.login.is_some() || req.ip.is_some() => {
                app.verdict.reset(req.login.as_deref(), req.ip);
                Json(json!({"status": "ok"})).into_response()
            }
            Ok(_) => bad_request("reset needs a login or an ip".to_string()),
            Err(err) => bad_request(err.to_string()),
        },
        other => (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "failure", "reason": format!("unknown command {other}")})),
        )
            .into_response(),
    };

    timer.observe_duration();
    response
}

async fn custom_command(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if let Err(response) = authorize(&app, &addr, &headers) {
        return response;
    }

    let Some(func) = app.custom.read().unwrap().get(&name).cloned() else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "failure", "reason": format!("unknown command {name}")})),
        )
            .into_response();
    };

    ops::metrics::inc_command(&name);
    let args: serde_json::Value = if body.is_empty() {
        json!({})
    } else {
        match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(err) => return bad_request(err.to_string()),
        }
    };
    Json(func(&args)).into_response()
}

/// Prometheus text exposition. ACL-gated only; no credentials required.
async fn metrics(
    State(app): State<Arc<App>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> Response {
    if !app.access.addr_allowed(&addr.ip()) {
        return unauthorized();
    }
    match ops::metrics::render() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}
