use axum::serve;
use coding_engine::api::routes::create_router;
use coding_engine::api::state::CodingState;
use coding_engine::config::AppConfig;
use coding_engine::store::PostgresStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    use env_logger::Builder;
    use log::LevelFilter;

    Builder::new()
        .filter_level(LevelFilter::Info)
        .filter_module("sqlx", LevelFilter::Warn)
        .init();

    println!("Coding engine: allocation, validation and reconciliation server");

    let config = AppConfig::load()?;
    println!(
        "Configuration loaded: server={}:{}",
        config.server.host, config.server.port
    );

    println!("Connecting to PostgreSQL...");
    let database_url = config.database_url()?;
    let postgres_store =
        PostgresStore::new(&database_url, config.database.max_connections.unwrap_or(20)).await?;

    println!("Running database migrations...");
    postgres_store.migrate().await?;

    let state = CodingState::new(Arc::new(postgres_store), &config);
    CodingState::start_maintenance(state.clone());
    let app = create_router().with_state(state).layer(CorsLayer::permissive());

    run_server(app, &config).await?;

    Ok(())
}

async fn run_server(app: axum::Router, config: &AppConfig) -> anyhow::Result<()> {
    let bind_address = config.server_address();
    let listener = TcpListener::bind(&bind_address).await?;
    println!("Coding engine running on http://{}", bind_address);

    serve(listener, app).await?;

    Ok(())
}
