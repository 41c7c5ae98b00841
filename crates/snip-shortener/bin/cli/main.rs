mod cli;

use crate::cli::{Command, LogFormat, CLI};
use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use snip_generator::RandomKeyGenerator;
use snip_shortener::{BatchItem, Resolution, ShortenerService};
use snip_storage::{AnyStorage, StorageConfig};
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

type Service = ShortenerService<AnyStorage, RandomKeyGenerator>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CLI::parse();
    init_tracing(config.log_format);

    info!(
        base_url = %config.base_url,
        delete_workers = config.delete_workers,
        "starting snip"
    );

    let storage = AnyStorage::from_config(StorageConfig::from_options(
        config.database_dsn,
        config.file_storage_path,
        config.delete_workers,
    ))
    .await
    .context("failed to open storage")?;

    let service = ShortenerService::new(storage, RandomKeyGenerator::default(), config.base_url);
    let result = run(&service, config.command, &config.user_id).await;

    // scheduled deletions must land before the process exits
    service.storage().shutdown().await;

    let output = result?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(service: &Service, command: Command, user_id: &str) -> anyhow::Result<Value> {
    let output = match command {
        Command::Shorten { url } => serde_json::to_value(service.shorten(url, user_id).await?)?,
        Command::Batch => {
            let mut input = String::new();
            tokio::io::stdin()
                .read_to_string(&mut input)
                .await
                .context("failed to read batch from stdin")?;
            let items: Vec<BatchItem> =
                serde_json::from_str(&input).context("batch must be a JSON array")?;
            serde_json::to_value(service.shorten_batch(items, user_id).await?)?
        }
        Command::Resolve { key } => match service.resolve(&key).await? {
            Resolution::Redirect(location) => json!({ "status": "redirect", "location": location }),
            Resolution::Gone => json!({ "status": "gone" }),
            Resolution::NotFound => json!({ "status": "not_found" }),
        },
        Command::List => serde_json::to_value(service.list(user_id).await?)?,
        Command::Delete { keys } => {
            let count = keys.len();
            service.delete(user_id, keys).await?;
            json!({ "status": "accepted", "count": count })
        }
        Command::Ping => {
            service.storage().ping().await?;
            json!({ "status": "ok", "storage": service.storage().kind().to_string() })
        }
    };
    Ok(output)
}
