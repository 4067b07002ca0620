use clap::{Parser, Subcommand};
use ferrio_server::config::{DatanodeConfig, NamenodeConfig, RegistryConfig};
use ferrio_server::service;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "ferrio")]
#[command(about = "Content-addressed distributed file storage")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the registry (service discovery) node
    Registry {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "registry.yaml")]
        conf: String,
    },
    /// Run a name service (metadata and admission)
    Namenode {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "namenode.yaml")]
        conf: String,
    },
    /// Run a data service (blob storage)
    Datanode {
        /// Path to configuration file
        #[arg(long = "conf", default_value = "datanode.yaml")]
        conf: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferrio=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Registry { conf } => {
            tracing::info!("starting registry with config: {}", conf);
            match RegistryConfig::from_file(&conf) {
                Ok(cfg) => service::registry::run(cfg).await,
                Err(error) => {
                    tracing::error!("failed to load config: {}", error);
                    std::process::exit(1);
                }
            }
        }
        Commands::Namenode { conf } => {
            tracing::info!("starting name service with config: {}", conf);
            match NamenodeConfig::from_file(&conf) {
                Ok(cfg) => service::namenode::run(cfg).await,
                Err(error) => {
                    tracing::error!("failed to load config: {}", error);
                    std::process::exit(1);
                }
            }
        }
        Commands::Datanode { conf } => {
            tracing::info!("starting data service with config: {}", conf);
            match DatanodeConfig::from_file(&conf) {
                Ok(cfg) => service::datanode::run(cfg).await,
                Err(error) => {
                    tracing::error!("failed to load config: {}", error);
                    std::process::exit(1);
                }
            }
        }
    };

    if let Err(error) = outcome {
        tracing::error!("server error: {}", error);
        std::process::exit(1);
    }
}
