//! HTTP handlers for the courier relay.
//!
//! The textual command endpoints (send, register, list/key updates)
//! reply with the `ok;...` / `error;` protocol; the subscription
//! endpoint upgrades to a server-sent-event stream fed by a broker
//! session; staged files are served once and then gone.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Router,
};
use bytes::Bytes;
use courier_core::{
    FlowLogManager, Message, MetricsWorker, ReceiveMode, Relay, RelayBuilder, WorkerFactory,
    FILE_MESSAGE, PICTURE_MESSAGE, TEXT_MESSAGE,
};
use futures_util::stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared server state.
pub struct AppState {
    /// The relay instance.
    pub relay: Arc<Relay>,
    /// Server configuration.
    pub config: Config,
}

/// Build the relay described by the configuration.
///
/// # Errors
///
/// Returns an error on fatal configuration faults.
pub fn build_relay(config: &Config) -> Result<Arc<Relay>> {
    let factory: WorkerFactory = Arc::new(|| Arc::new(MetricsWorker::new()) as _);
    let workers = config.pipeline.worker_count;
    let capacity = config.pipeline.queue_capacity;

    let mut builder = RelayBuilder::new()
        .channel(TEXT_MESSAGE, factory.clone(), workers, capacity)
        .channel(PICTURE_MESSAGE, factory.clone(), workers, capacity)
        .channel(FILE_MESSAGE, factory, workers, capacity)
        .classifier_count(config.pipeline.classifier_count)
        .host(format!("{}:{}", config.host, config.port))
        .file_root(config.paths.file_root.trim_matches('/'))
        .secret_key(&config.user.secret_key)
        .expire_sweep_period(Duration::from_secs(config.user.expire_sweep_secs));

    if config.pipeline.flow_log_secs > 0 {
        let manager = Arc::new(FlowLogManager::new(Duration::from_secs(
            config.pipeline.flow_log_secs,
        )));
        for kind in [TEXT_MESSAGE, PICTURE_MESSAGE, FILE_MESSAGE] {
            builder = builder.group_manager(kind, manager.clone());
        }
    }

    Ok(Arc::new(builder.build()?))
}

/// Run the HTTP server until it stops, then cascade the shutdown
/// through the relay.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let relay = build_relay(&config)?;
    relay.start();

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let app = routes(Arc::new(AppState {
        relay: relay.clone(),
        config: config.clone(),
    }));

    let listener = TcpListener::bind(addr).await?;
    info!("courier listening on {}", addr);
    info!(
        "SSE endpoint: http://{}{}/<check-code>",
        addr, config.paths.communication
    );

    axum::serve(listener, app).await?;

    relay.stop();
    Ok(())
}

/// Build the route table from the configured path prefixes.
pub fn routes(state: Arc<AppState>) -> Router {
    let paths = &state.config.paths;
    let file_root = paths.file_root.trim_matches('/');

    Router::new()
        .route(
            &format!("{}/:check_code", paths.communication),
            get(subscribe),
        )
        .route(&paths.sender, post(publish))
        .route(&paths.register, post(register))
        .route(&paths.update_list, put(update_list))
        .route(&paths.update_key, post(update_key))
        .route(&format!("/{file_root}/:hash/:name"), get(fetch_file))
        .route("/health", get(health))
        .with_state(state)
}

/// Liveness probe.
async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Deserialize)]
struct SubscribeQuery {
    /// Evict any previous subscriptions for the same user id.
    #[serde(default)]
    race: bool,
}

/// GET `{communication}/:check_code` — start a broker-backed SSE stream
/// for the authenticated user, with the user's filter attached.
async fn subscribe(
    Path(check_code): Path<String>,
    Query(query): Query<SubscribeQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = match state.relay.validate(&check_code) {
        Ok(user) => user,
        Err(err) => {
            debug!(error = %err, "subscription rejected");
            metrics::record_error("validate");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let mut broker = state.relay.broker();
    broker.set_race(query.race);
    broker.clear_filters();
    broker.add_filter(user.filter());

    let session = match broker.attach(user.id(), &state.relay) {
        Ok(session) => session,
        Err(err) => {
            warn!(user = user.id(), error = %err, "broker attach failed");
            metrics::record_error("attach");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let guard = ConnectionMetricsGuard::new();
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        session.serve(tx).await;
        drop(guard);
    });

    let body = Body::from_stream(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|bytes| (Ok::<_, Infallible>(bytes), rx))
    }));

    (
        [
            (header::CONTENT_TYPE, "text/event-stream;charset=utf-8"),
            (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            (header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}

/// POST `{sender}` — build the typed message described by the request
/// headers and publish it.
async fn publish(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> &'static str {
    let Some(check_code) = header_str(&headers, "Check-Code") else {
        return error_reply("publish", "missing Check-Code");
    };
    let sender = match state.relay.validate(check_code) {
        Ok(user) => user.id().to_owned(),
        Err(_) => return error_reply("publish", "bad check code"),
    };
    let Some(target) = header_str(&headers, "Target-Id") else {
        return error_reply("publish", "missing Target-Id");
    };
    let Some(kind) = header_str(&headers, "Message-Type") else {
        return error_reply("publish", "missing Message-Type");
    };

    let message = match kind {
        TEXT_MESSAGE => Message::text(String::from_utf8_lossy(&body).into_owned()),
        PICTURE_MESSAGE => {
            let Some(suffix) = header_str(&headers, "Pic-Suffix") else {
                return error_reply("publish", "missing Pic-Suffix");
            };
            Message::picture(body.clone(), suffix)
        }
        FILE_MESSAGE => {
            let Some(filename) = header_str(&headers, "File-Name") else {
                return error_reply("publish", "missing File-Name");
            };
            Message::file(body.clone(), filename)
        }
        _ => return error_reply("publish", "unknown Message-Type"),
    };

    let mut message = message.with_sender(sender).with_target(target);
    if let Some(group) = header_str(&headers, "Group-Id") {
        message = message.with_group(group);
    }

    metrics::record_published(kind, body.len());
    let _waiter = state.relay.send(message);
    "ok;"
}

/// POST `{register}` — register a user against the shared secret.
/// Replies `ok;<check_code>` or `error;`.
async fn register(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> String {
    let (Some(user_id), Some(secret), Some(expire)) = (
        header_str(&headers, "User-Id"),
        header_str(&headers, "Secret-Key"),
        header_str(&headers, "Expire-Time"),
    ) else {
        metrics::record_error("register");
        return "error;".to_owned();
    };

    let Ok(minutes) = expire.parse::<u64>() else {
        metrics::record_error("register");
        return "error;".to_owned();
    };

    let mode = header_str(&headers, "Receive-Mode")
        .and_then(|value| value.parse::<ReceiveMode>().ok())
        .unwrap_or_default();

    match state.relay.users().register_user(
        secret,
        user_id,
        Duration::from_secs(minutes * 60),
        mode,
        &body,
    ) {
        Ok(check_code) => {
            metrics::record_user_registered();
            format!("ok;{check_code}")
        }
        Err(err) => {
            debug!(user = user_id, error = %err, "registration rejected");
            metrics::record_error("register");
            "error;".to_owned()
        }
    }
}

/// PUT `{update_list}` — apply `Add`/`Del` commands to the user's
/// allow or deny list.
async fn update_list(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> &'static str {
    let (Some(check_code), Some(list)) = (
        header_str(&headers, "User-CheckCode"),
        header_str(&headers, "List"),
    ) else {
        return error_reply("update_list", "missing headers");
    };

    match state.relay.users().update_receive_list(check_code, list, &body) {
        Ok(()) => "ok;",
        Err(err) => {
            debug!(error = %err, "list update rejected");
            metrics::record_error("update_list");
            "error;"
        }
    }
}

/// POST `{update_key}` — swap the registration secret.
async fn update_key(State(state): State<Arc<AppState>>, headers: HeaderMap) -> &'static str {
    let (Some(old), Some(new)) = (
        header_str(&headers, "Secret-Key"),
        header_str(&headers, "New-Key"),
    ) else {
        return error_reply("update_key", "missing headers");
    };

    match state.relay.users().update_secret_key(old, new) {
        Ok(()) => "ok;",
        Err(err) => {
            debug!(error = %err, "key update rejected");
            metrics::record_error("update_key");
            "error;"
        }
    }
}

/// GET `/{file_root}/:hash/:name` — serve and consume a staged file.
async fn fetch_file(
    Path((hash, name)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
) -> Response {
    match state.relay.fetch_file(&hash) {
        Some(content) => {
            metrics::record_file_served();
            debug!(hash = %hash, name = %name, bytes = content.len(), "served staged file");
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                Body::from(content),
            )
                .into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn error_reply(handler: &str, reason: &str) -> &'static str {
    debug!(handler, reason, "request rejected");
    metrics::record_error(handler);
    "error;"
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.user.secret_key = "s3cret".into();
        config.pipeline.worker_count = 1;
        config
    }

    #[tokio::test]
    async fn test_build_relay_registers_standard_kinds() {
        let relay = build_relay(&test_config()).unwrap();
        assert!(relay.group(TEXT_MESSAGE).is_some());
        assert!(relay.group(PICTURE_MESSAGE).is_some());
        assert!(relay.group(FILE_MESSAGE).is_some());
    }

    #[tokio::test]
    async fn test_routes_build_from_config() {
        let config = test_config();
        let relay = build_relay(&config).unwrap();
        let _router = routes(Arc::new(AppState { relay, config }));
    }
}
