use polyroute::config::Config;
use polyroute::error::AppError;

#[tokio::main]
async fn main() {
    let config = Config::load_default();
    let default_filter = if config.log.level.trim().is_empty() {
        "info,polyroute=debug".to_string()
    } else {
        format!("info,polyroute={}", config.log.level.trim())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .json()
        .init();

    if let Err(err) = run(config).await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), AppError> {
    let addr: std::net::SocketAddr = config.listen_addr().parse().map_err(
        |err: std::net::AddrParseError| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "listen_invalid",
                err.to_string(),
            )
        },
    )?;
    let state = polyroute::app::load_state(config).await?;
    let app = polyroute::app::build_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "listen_failed",
            err.to_string(),
        )
    })?;
    tracing::info!("listening on {}", addr);
    axum::serve(listener, app).await.map_err(|err| {
        AppError::new(
            axum::http::StatusCode::BAD_REQUEST,
            "serve_failed",
            err.to_string(),
        )
    })?;
    Ok(())
}
