use framed_server::{Config, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        dispatch = ?config.dispatch,
        handler = ?config.handler,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        read_timeout = ?config.read_timeout,
        write_timeout = ?config.write_timeout,
        "Starting framed-server"
    );

    let handler = config.handler.build();
    Server::bind(config, handler)?.run()?;
    Ok(())
}
