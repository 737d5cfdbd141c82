//! Paddle Arena Server
//!
//! Binds the websocket endpoint and runs until Ctrl-C.

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use paddle_arena::{GameServer, ServerConfig, VERSION};

#[cfg(feature = "debug-tracing")]
const DEFAULT_FILTER: &str = "debug";
#[cfg(not(feature = "debug-tracing"))]
const DEFAULT_FILTER: &str = "info";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if matches!(std::env::var("LOG_FORMAT").as_deref(), Ok("json")) {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServerConfig::from_env();
    info!("Paddle Arena Server v{}", VERSION);
    info!(
        "Winning score {}, match length {}s, tick {:?}",
        config.hub.game.winning_score, config.hub.game.match_duration_secs, config.hub.tick_interval
    );

    let server = GameServer::new(config);
    let run = server.run();
    tokio::pin!(run);

    tokio::select! {
        result = &mut run => return result.context("game server stopped"),
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
        }
    }

    info!("Shutting down");
    server.shutdown();
    run.await.context("game server stopped")?;
    Ok(())
}
