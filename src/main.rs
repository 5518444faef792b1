use anyhow::{Context as _, Result};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use strata::{
    config::Config,
    engine::{Directory, Disabled, Engine, Resolver, Settings},
    feed::Rpc,
    store::{Database, Memory, Sqlite},
};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

#[derive(Parser)]
struct Arguments {
    #[clap(short, long, env = "STRATACONFIG", default_value = "strata.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Arguments::parse();
    let config = Config::load(&args.config).context("failed to load configuration")?;

    tracing::info!("{config:#?}");

    match config.database.scheme() {
        "sqlite" => {
            let database = Sqlite::open(&config.database)?;
            run(config, database).await
        }
        "memory" => run(config, Memory::new()).await,
        scheme => anyhow::bail!("unsupported database scheme {scheme}"),
    }
}

async fn run(config: Config, database: impl Database) -> Result<()> {
    let resolver: Arc<dyn Resolver> = match &config.content_dir {
        Some(root) => Arc::new(Directory::new(root)),
        None => Arc::new(Disabled),
    };
    let mut engine = Engine::new(
        database,
        config.registry()?,
        resolver,
        Settings {
            strict: config.indexer.strict,
            retries: config.indexer.retries,
            retry_interval: config.indexer.retry_interval,
        },
    )?;
    for source in config.watched_sources() {
        engine.watch(source)?;
    }

    // The engine resumes the feed after its head, once the head is verified
    // to still be canonical.
    tracing::info!(start = %config.start(), head = ?engine.head(), "starting indexer");
    let feed = Rpc::new(
        ethrpc::http::Client::new(config.ethrpc.clone()),
        config.start(),
        config.indexer.page_size,
    );
    engine.run(feed, config.indexer.poll_interval).await
}
