use clap::Parser;
use server::server::GameServer;

/// Parses command-line arguments, binds the listener, and runs the tick loop
/// until interrupted.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "60")]
        tick_rate: u32,
    }

    let args = Args::parse();
    env_logger::init();

    let address = format!("{}:{}", args.host, args.port);
    let game_server = GameServer::bind(&address, args.tick_rate).await?;

    tokio::select! {
        _ = game_server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    Ok(())
}
