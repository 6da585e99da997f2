use clap::Parser;
use tracing::{error, info, warn};

use switchboard::{
    cli::{self, Cli, Commands},
    config::Config,
    websocket::{router, RelayState},
};

#[tokio::main]
async fn main() {
    // Default to INFO if RUST_LOG is not set.
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info");
    }
    tracing_subscriber::fmt::init();

    let args = Cli::parse();
    let config = Config::from_env();

    if let Some(Commands::GenerateToken { mode }) = args.command {
        if let Err(err) = cli::generate_token(&config, &mode) {
            error!("failed to generate token: {err}");
            std::process::exit(1);
        }
        return;
    }

    if config.uses_default_secret() {
        warn!("running with the default signing secret; set SWITCHBOARD_SECRET in production");
    }

    info!("Starting switchboard relay on port {}", config.port);
    info!("Translator endpoint: {}", config.translator_url);

    let state = RelayState::new(&config);
    let app = router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind listen address");

    info!("switchboard listening on {addr}");

    axum::serve(listener, app)
        .await
        .expect("failed to start server");
}
