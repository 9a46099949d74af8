//! Chorus 릴레이 서버

use anyhow::Context;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{HeaderValue, StatusCode},
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use chorus_relay::config::Config;
use chorus_relay::handlers;
use chorus_relay::protocol::ServerMessage;
use chorus_relay::state::AppState;
use chorus_relay::store::{bounded, MemoryStore, SqliteStore};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    // 로깅 초기화
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let state = Arc::new(open_state(config.clone()).await?);

    // 채널 락 정리 스케줄러
    let cleanup_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            let pruned = cleanup_state.prune_sequencers();
            if pruned > 0 {
                tracing::info!(pruned, "Idle channel sequencers pruned");
            }
        }
    });

    // 라우터 설정
    let mut app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler));
    if config.history_api {
        tracing::warn!("History API enabled, /api must sit behind the auth proxy");
        app = app.route("/api/channels/:id/messages", get(history_handler));
    }
    let app = app
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&config.cors_origins)),
        )
        .with_state(state.clone());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("Chorus relay started");
    tracing::info!("Address: {}", addr);
    tracing::info!("WebSocket: ws://{}/ws", addr);

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}

/// `DATABASE_URL=memory`이면 휘발성 메모리 저장소로 실행한다.
async fn open_state(config: Config) -> anyhow::Result<AppState> {
    if config.database_url == "memory" {
        tracing::warn!("Using in-memory store, nothing will be persisted");
        let store = Arc::new(MemoryStore::default());
        return Ok(AppState::new(config, store.clone(), store));
    }

    let store = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open {}", config.database_url))?,
    );
    Ok(AppState::new(config, store.clone(), store))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

async fn index_handler() -> Html<&'static str> {
    Html("<h1>Chorus Relay</h1><p>WebSocket endpoint: /ws</p>")
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let (connections, rooms) = {
        let hub = state.hub();
        (hub.connection_count(), hub.room_count())
    };
    Json(serde_json::json!({
        "status": "ok",
        "server": "chorus-relay",
        "connections": connections,
        "rooms": rooms,
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

/// 채널 기록 조회 (읽기 전용)
///
/// 요청자 확인을 하지 않는다. `HISTORY_API=true`일 때만 등록되며 인증 프록시 뒤에 둔다.
async fn history_handler(
    Path(channel_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let history = bounded(
        state.config.limits.persist_timeout(),
        state.messages().list_by_channel(channel_id),
    )
    .await;

    match history {
        Ok(messages) => Json(messages).into_response(),
        Err(e) => {
            tracing::error!(channel_id, error = %e, "History query failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(state.config.limits.outbound_queue);

    // 연결 처리
    let connection_id = handlers::handle_connection(&state, tx);
    let send_timeout = state.config.limits.send_timeout();

    // 송신 태스크
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            match tokio::time::timeout(send_timeout, ws_sender.send(Message::Text(json))).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    tracing::warn!(connection_id = %connection_id, "Outbound frame timed out, closing");
                    break;
                }
            }
        }
    });

    // 수신 처리. 저장소 이벤트는 연결별 큐에서 차례로 처리된다.
    let pipeline = handlers::Pipeline::spawn(
        state.clone(),
        connection_id,
        state.config.limits.outbound_queue,
    );
    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !pipeline.route(&state, connection_id, &text).await {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = &mut send_task => break,
        }
    }

    // 연결 해제
    handlers::handle_disconnect(&state, connection_id);
    drop(pipeline);
    send_task.abort();
}
