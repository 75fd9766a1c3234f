use anyhow::Context;
use clap::{Parser, Subcommand};
use infomesh::{logging::init_logging, node::STATUS_INTERVAL, Node, NodeConfig};
use mesh_probe::model::{self, source_role};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "infomesh", version, about = "Replicated object-graph mesh node")]
struct Cli {
    /// Node configuration file (YAML)
    #[arg(short, long, env = "INFOMESH_CONFIG", global = true)]
    config: Option<String>,

    /// Log level, overridden by RUST_LOG
    #[arg(long, env = "INFOMESH_LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "INFOMESH_LOG_JSON", global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Probe a resource and print the objects found for it
    Probe {
        /// URL, file URL or bare host name
        source: String,
        /// Also print the services the resource offers
        #[arg(long)]
        services: bool,
        /// Also resolve the resources it links to
        #[arg(long)]
        links: bool,
    },
    /// Run a node until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.json);

    let config = match &cli.config {
        Some(path) => NodeConfig::from_file(path)
            .await
            .with_context(|| format!("loading {path}"))?,
        None => NodeConfig::default(),
    };
    let node = Node::start(&config).context("starting node")?;

    let result = match cli.command {
        Command::Probe {
            source,
            services,
            links,
        } => probe(&node, &source, services, links).await,
        Command::Serve => serve(&node).await,
    };
    node.shutdown();
    result
}

async fn probe(node: &Node, source: &str, services: bool, links: bool) -> anyhow::Result<()> {
    let home = node
        .access(source)
        .await
        .with_context(|| format!("probing {source}"))?;
    println!("{}", serde_json::to_string_pretty(&home)?);

    if services {
        for service in node
            .traverse(home.identifier(), &source_role(model::OFFERS))
            .await?
        {
            println!("{}", serde_json::to_string_pretty(&service)?);
            for endpoint in node
                .traverse(service.identifier(), &source_role(model::PROVIDED_AT))
                .await?
            {
                println!("{}", serde_json::to_string_pretty(&endpoint)?);
            }
        }
    }
    if links {
        for linked in node
            .traverse(home.identifier(), &source_role(model::LINKS_TO))
            .await?
        {
            println!("{}", serde_json::to_string_pretty(&linked)?);
        }
    }
    Ok(())
}

async fn serve(node: &Node) -> anyhow::Result<()> {
    info!(identifier = %node.identifier(), "Serving, press Ctrl+C to stop");
    let mut status = tokio::time::interval(STATUS_INTERVAL);
    loop {
        tokio::select! {
            _ = status.tick() => node.log_status(),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Failed to listen for Ctrl+C");
                }
                info!("Shutdown signal received");
                return Ok(());
            }
        }
    }
}
