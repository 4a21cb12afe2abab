//! API routes

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chat::{ChatSnapshot, TurnError};
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct TurnRequest {
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct TurnAccepted {
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for TurnError {
    fn into_response(self) -> Response {
        let status = match self {
            TurnError::EmptyPrompt => StatusCode::BAD_REQUEST,
            TurnError::Busy => StatusCode::CONFLICT,
        };
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn transcript(State(state): State<AppState>) -> Json<ChatSnapshot> {
    Json(state.controller.snapshot())
}

/// Accept a turn and stream the reply in the background
async fn send_turn(
    State(state): State<AppState>,
    Json(request): Json<TurnRequest>,
) -> Result<(StatusCode, Json<TurnAccepted>), TurnError> {
    let turn = state.controller.begin_turn(&request.prompt)?;

    let accepted = TurnAccepted {
        user_message_id: turn.user_message_id,
        assistant_message_id: turn.assistant_message_id,
    };

    let controller = state.controller.clone();
    tokio::spawn(async move { controller.run_turn(turn).await });

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

/// Push the transcript to the client after every change
async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut receiver = state.controller.subscribe();

    let stream = async_stream::stream! {
        loop {
            let snapshot = ChatSnapshot::from(&*receiver.borrow_and_update());
            match Event::default().event("snapshot").json_data(&snapshot) {
                Ok(event) => yield Ok::<_, Infallible>(event),
                Err(e) => tracing::warn!(error = %e, "Failed to encode snapshot"),
            }

            if receiver.changed().await.is_err() {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/transcript", get(transcript))
        .route("/v1/turns", post(send_turn))
        .route("/v1/events", get(events))
}
