//! axum WebSocket transport for a [`Dispatcher`].

use {
    axum::{
        Router,
        extract::{
            State, WebSocketUpgrade,
            ws::{Message as WsMessage, WebSocket},
        },
        http::{HeaderMap, header::AUTHORIZATION},
        response::{IntoResponse, Json},
        routing::get,
    },
    futures::{SinkExt, StreamExt, future},
    tokio::net::TcpListener,
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::{debug, info},
};

use crate::{Result, dispatcher::Dispatcher};

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the router: the RPC WebSocket route at `path` plus `/health`.
pub fn router(dispatcher: Dispatcher, path: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route(path, get(ws_upgrade_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(dispatcher)
}

/// Accept connections on `listener` until the server stops.
pub async fn serve(listener: TcpListener, dispatcher: Dispatcher, path: &str) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, path, "switchyard listening");
    axum::serve(listener, router(dispatcher, path)).await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(dispatcher): State<Dispatcher>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": switchyard_protocol::JSONRPC_VERSION,
        "connections": dispatcher.connection_count().await,
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(dispatcher): State<Dispatcher>,
) -> impl IntoResponse {
    let token = bearer_token(&headers).map(str::to_owned);
    ws.on_upgrade(move |socket| handle_socket(socket, dispatcher, token))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn handle_socket(socket: WebSocket, dispatcher: Dispatcher, token: Option<String>) {
    let credentials = dispatcher.authenticate(token.as_deref()).await;
    let (conn, mut outbound) = dispatcher.connect(credentials);
    let (mut sink, stream) = socket.split();

    // Write loop: drains the connection's outbound queue into the socket.
    let conn_id = conn.id().to_owned();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                debug!(conn_id, error = %e, "websocket write failed");
                break;
            }
        }
        if let Err(e) = sink.close().await {
            debug!(conn_id, error = %e, "websocket close failed");
        }
    });

    // Text frames only; a close frame or read error ends the connection.
    let frames = stream
        .take_while(|msg| future::ready(matches!(msg, Ok(m) if !matches!(m, WsMessage::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(WsMessage::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        });

    dispatcher.serve(conn, frames).await;
    writer.abort();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, axum::http::HeaderValue, rstest::rstest};

    #[rstest]
    #[case(Some("Bearer abc"), Some("abc"))]
    #[case(Some("Basic abc"), None)]
    #[case(Some("bearer abc"), None)]
    #[case(None, None)]
    fn bearer_tokens(#[case] header: Option<&str>, #[case] expected: Option<&str>) {
        let mut headers = HeaderMap::new();
        if let Some(value) = header {
            headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        }
        assert_eq!(bearer_token(&headers), expected);
    }
}
