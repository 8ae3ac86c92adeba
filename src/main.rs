//! # Plugins CLI
//!
//! Inspect the built-in adapters and drive the local adapter end to end.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use plugins::adapters::{
    AdapterContext, DEFAULT_PAGE_SIZE, DirEntryRequest, LOCAL_PLUGIN_ID, Registry,
    local::DIRECTORY_FIELD,
};
use plugins::auth::{AuthMethod, FormData, FormItem, FormValue};
use plugins::config::ConfigLoader;
use plugins::telemetry::init_tracing;

#[derive(Parser, Debug)]
#[command(name = "plugins")]
#[command(author, version, about = "Storage backend adapters for the media host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print metadata for every registered adapter
    Adapters,
    /// Authenticate the local adapter against a directory and list it
    Browse {
        /// Directory to attach
        #[arg(long)]
        dir: String,
        /// Path inside the directory
        #[arg(long, default_value = "/")]
        path: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
        page_size: u32,
    },
    /// Print the loaded configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load().context("loading configuration")?;
    init_tracing(&config).context("initializing tracing")?;
    info!(profile = %config.profile, "configuration loaded");

    match cli.command {
        Command::Adapters => {
            let registry = Registry::with_builtin_adapters();
            println!("{}", serde_json::to_string_pretty(&registry.list_metadata())?);
        }
        Command::Config => {
            println!("{}", config.redacted_json()?);
        }
        Command::Browse {
            dir,
            path,
            page,
            page_size,
        } => {
            let registry = Registry::with_builtin_adapters();
            let context = AdapterContext::from_config(config).context("building adapter context")?;
            let adapter = registry.create(LOCAL_PLUGIN_ID, &context)?;

            let form = FormData::new(vec![FormItem::new(
                DIRECTORY_FIELD,
                FormValue::DirectoryPath(dir),
            )]);
            let auth_data = adapter
                .check_auth_method(AuthMethod::FormInput(form))
                .await?
                .context("local adapter returned no auth data")?;
            adapter.check_auth_data(&auth_data.bytes).await?;

            let listing = adapter
                .get_dir_entry(DirEntryRequest {
                    page,
                    page_size,
                    ..DirEntryRequest::new(path)
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
    }
    Ok(())
}
