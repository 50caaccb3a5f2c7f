use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sql_advisor::config::Config;
use sql_advisor::services::sql_analyzer::{SqlAnalyzer, init_catalog};
use sql_advisor::{AppState, db, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first; its messages are logged once the subscriber is up
    let config = Config::load()?;

    // Initialize logging
    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);

    let registry = tracing_subscriber::registry().with(log_filter);

    // Keep the guard alive for the whole process so buffered lines are flushed
    let _log_guard = if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).filter(|p| !p.is_empty()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("sql-advisor.log");
        // Rolling appender adds the date suffix
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    };
    tracing::info!("SQL Advisor starting up");
    config.log_load_messages();
    tracing::info!("Configuration loaded successfully");

    let pool = db::create_pool(&config.database).await?;
    tracing::info!(
        "Database pool created (max_connections={}, statement_timeout={}ms)",
        config.database.max_connections,
        config.database.statement_timeout_ms
    );

    let catalog = Arc::new(init_catalog());
    tracing::info!("Rule catalog initialized with {} rules", catalog.len());

    let analyzer = SqlAnalyzer::from_pool(pool.clone(), catalog, &config.analysis);
    tracing::info!(
        "Analyzer ready (rewrites={}, parallel_rules={}, bulk_concurrency={}, summary={})",
        config.analysis.enable_rewrites,
        config.analysis.parallel_rules,
        config.analysis.bulk_concurrency,
        config.analysis.summary
    );

    let app_state = Arc::new(AppState { db: pool, analyzer: Arc::new(analyzer) });
    let app = router::app_router(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API documentation available at http://{}/api-docs", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
