//! ConversAI - minimal streaming chat service
//!
//! Forwards each prompt to an OpenAI-compatible chat-completions endpoint
//! and streams the reply into a shared transcript. A browser or terminal UI
//! drives it over a small JSON API and follows updates over SSE.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod chat;
mod config;
mod conversation;
mod error;
mod providers;
mod routes;
mod stream;

use chat::ConversationController;
use config::Config;
use providers::OpenAiCompatTransport;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ConversationController>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conversai=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let transport = Arc::new(OpenAiCompatTransport::new(&config.llm)?);
    tracing::info!("🔌 Upstream {} using model {}", config.llm.endpoint, config.llm.model);

    let controller = Arc::new(
        ConversationController::new(transport, config.credential.clone())
            .with_max_line_bytes(config.llm.max_line_bytes)
            .with_greeting(config.chat.greeting()),
    );

    let state = AppState { controller };

    let app = Router::new()
        .merge(routes::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::info!("🔥 ConversAI running at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
