use saml2idp::{web, Config};
use tower_sessions::MemoryStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Configuration comes first: it carries the default log filter
    let path = Config::config_path();
    let mut config = Config::from_file(&path).unwrap_or_else(|e| {
        eprintln!("Configuration error ({path}): {e}");
        std::process::exit(1);
    });
    config.apply_env_overrides();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let state = web::AppState::from_config(&config).unwrap_or_else(|e| {
        eprintln!("Startup error: {e}");
        std::process::exit(1);
    });

    tracing::info!(
        entity_id = %state.idp.entity_id,
        base_url = %state.idp.base_url(),
        metadata_url = %state.idp.metadata_url(),
        service_providers = state.registry.len(),
        "starting saml2idp"
    );

    let app = web::app(state, MemoryStore::default());

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .unwrap_or_else(|e| {
            eprintln!("Failed to bind {}: {e}", config.server.bind);
            std::process::exit(1);
        });

    tracing::info!(bind = %config.server.bind, "saml2idp listening");

    axum::serve(listener, app).await.unwrap_or_else(|e| {
        eprintln!("Server error: {e}");
        std::process::exit(1);
    });
}
