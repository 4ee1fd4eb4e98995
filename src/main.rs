mod db;
mod event;
mod judge;
mod llm;
mod routes;
mod services;
mod state;

use std::sync::Arc;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "5000".into())
        .parse()
        .expect("invalid PORT");

    // Statistics store (non-fatal: post-game stats disabled if unset).
    let pool = match std::env::var("DATABASE_URL") {
        Ok(url) => match db::init_pool(&url).await {
            Ok(pool) => {
                tracing::info!("statistics database connected");
                Some(pool)
            }
            Err(e) => {
                tracing::warn!(error = %e, "database init failed — stats disabled");
                None
            }
        },
        Err(_) => {
            tracing::warn!("DATABASE_URL not set — stats disabled");
            None
        }
    };

    // Challenge generator (non-fatal: generation disabled if config missing).
    let generator: Option<Arc<dyn llm::GenerateChallenge>> = match llm::AnthropicClient::from_env() {
        Ok(client) => {
            tracing::info!(model = client.model(), "challenge generator initialized");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!(error = %e, "generator not configured — challenge generation disabled");
            None
        }
    };

    // Code runner (non-fatal: solution evaluation disabled if unset).
    let runner: Option<Arc<dyn judge::RunCode>> = match judge::Judge0Client::from_env() {
        Ok(client) => {
            tracing::info!("execution client initialized");
            Some(Arc::new(client))
        }
        Err(e) => {
            tracing::warn!(error = %e, "execution service not configured — evaluation disabled");
            None
        }
    };

    let state = state::AppState::new(pool, generator, runner);

    let app = routes::app(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .expect("failed to bind");

    tracing::info!(%port, "coderoom listening");
    axum::serve(listener, app).await.expect("server failed");
}
