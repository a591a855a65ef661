use place_canvas::{CanvasServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_string());
    let config = ServerConfig::load_or_default(&path);

    let server = match CanvasServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            log::error!("Failed to start: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = server.run().await {
        log::error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
