use clap::Parser;

use chatrelay::bootstrap;
use chatrelay::channels::web;
use chatrelay::Config;

#[derive(Parser)]
#[command(name = "chatrelay", about = "Streaming gateway between chat platforms and LLM backends")]
struct Cli {
    /// Listen address override.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Listen port override.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bootstrap::init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let services = bootstrap::build_services(config)?;

    let sweeper = services
        .supervisor
        .spawn_sweeper(services.config.stream.sweep_interval);
    let monitor = services.pool.spawn_monitor(&services.config.worker);

    let result = web::start_server(&services.config.server, services.state.clone()).await;

    sweeper.abort();
    monitor.abort();

    result?;
    Ok(())
}
