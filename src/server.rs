//! The `serve` surface: one HTTP endpoint that resolves magnet links on
//! demand.
//!
//! `GET /?magnet=<URI>` returns JSON with the torrent base64-encoded, or
//! the raw file as an attachment when `direct=1` is passed. An optional
//! API key guards the endpoint.
use crate::config::Config;
use crate::fetch::Fetcher;
use crate::tracker::url_encode;
use axum::extract::Query;
use axum::extract::State;
use axum::http::header;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::Json;
use axum::Router;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Debug)]
struct ServeState {
    config: Config,
    apikey: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TorrentQuery {
    magnet: Option<String>,
    direct: Option<String>,
    apikey: Option<String>,
}

/// Runs the HTTP service until the process exits.
pub async fn serve(addr: SocketAddr, config: Config, apikey: Option<String>) -> anyhow::Result<()> {
    let state = Arc::new(ServeState { config, apikey });
    let app = Router::new().route("/", get(get_torrent)).with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "serving magnet requests over HTTP");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn get_torrent(
    State(state): State<Arc<ServeState>>,
    Query(query): Query<TorrentQuery>,
) -> Response {
    if let Some(expected) = &state.apikey {
        if query.apikey.as_deref() != Some(expected) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let Some(magnet) = query.magnet else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "magnet argument missing from url",
            })),
        )
            .into_response();
    };

    let fetcher = Fetcher::new(state.config.clone());
    let (filename, torrent) = match fetcher.retrieve(&magnet).await {
        Ok(result) => result,
        Err(err) => {
            info!("failed to serve magnet request: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "status": "error",
                    "message": "failed to retrieve magnet link",
                })),
            )
                .into_response();
        }
    };

    if query.direct.is_some() {
        let disposition = format!(
            "attachment; filename*=UTF-8''{}",
            url_encode(filename.as_bytes())
        );
        (
            [
                (header::CONTENT_TYPE, "application/x-bittorrent".to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            torrent,
        )
            .into_response()
    } else {
        Json(json!({
            "status": "success",
            "filename": filename,
            "torrent_data": base64::engine::general_purpose::STANDARD.encode(&torrent),
        }))
        .into_response()
    }
}
