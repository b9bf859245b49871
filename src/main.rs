use clap::{Parser, Subcommand};
use std::error::Error;

#[derive(Parser)]
#[command(name = "drift")]
#[command(about = "Decentralized content-addressed file store", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a storage node
    Serve {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:3000")]
        listen: String,

        /// Peer address to dial at startup (repeatable)
        #[arg(short, long)]
        bootstrap: Vec<String>,

        /// Root directory for stored files
        #[arg(short, long, default_value = drift::DEFAULT_ROOT)]
        root: String,

        /// Hex-encoded 32-byte encryption key shared by the cluster
        /// (generated and logged when omitted)
        #[arg(short, long)]
        key: Option<String>,
    },
    /// Run a two-node demo cluster on localhost
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Serve {
            listen,
            bootstrap,
            root,
            key,
        } => {
            drift::commands::serve::run(listen, bootstrap, root, key).await?;
        }
        Commands::Demo => {
            drift::commands::demo::run().await?;
        }
    }

    Ok(())
}
