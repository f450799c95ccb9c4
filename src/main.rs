use clustermap::config::NodeConfig;
use clustermap::node::NodeRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.is_empty() {
        eprintln!("Usage: clustermap --bind <addr:port> [--seed <addr:port>] [options]");
        eprintln!();
        eprintln!("Options:");
        eprintln!("  --bind <addr:port>        UDP address to bind (required)");
        eprintln!("  --seed <addr:port>        bootstrap server; omit to BE the server");
        eprintln!("  --boot-threshold <n>      hosts required before seeding (default 3)");
        eprintln!("  --scatter-width <n>       copyset fan-out bound (default 4)");
        eprintln!("  --config <file.json>      load everything from a JSON file instead");
        eprintln!();
        eprintln!("Example: clustermap --bind 127.0.0.1:5000");
        eprintln!("Example: clustermap --bind 127.0.0.1:5001 --seed 127.0.0.1:5000");
        std::process::exit(1);
    }

    let config = NodeConfig::from_args(&args)?;

    tracing::info!("starting node on {}", config.bind);
    if config.is_bootstrap_server() {
        tracing::info!("no seeds given: acting as bootstrap server (cluster founder)");
    } else {
        tracing::info!("bootstrap server: {:?}", config.seeds);
    }

    let runtime = NodeRuntime::start(config).await?;
    runtime.run().await
}
