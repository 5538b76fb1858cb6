use std::path::PathBuf;
use std::sync::Arc;

use facade::acquire::Acquirer;
use facade::cache::CacheDir;
use facade::config::OriginConfig;
use facade::server::{serve, Origin};
use facade::store::MemoryStore;
use facade::sync::Broadcaster;
use facade::{janitor, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "serve" => cmd_serve(&args[2..]).await?,
        "version" | "--version" | "-V" => println!("facade {}", env!("CARGO_PKG_VERSION")),
        "help" | "--help" | "-h" => print_usage(),
        _ => {
            eprintln!("unknown command: {}", args[1]);
            print_usage();
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn cmd_serve(args: &[String]) -> Result<()> {
    let config = match arg_value(args, "--config") {
        Some(path) => OriginConfig::from_file(&PathBuf::from(path))?,
        None => OriginConfig::default(),
    };
    if let Some(listen) = arg_value(args, "--listen") {
        return run(OriginConfig { listen, ..config }).await;
    }
    run(config).await
}

async fn run(config: OriginConfig) -> Result<()> {
    std::fs::create_dir_all(&config.output_root)?;

    // The relational metadata backend plugs in through MetadataStore; the
    // bundled binary runs against the in-memory store for local use.
    let store = Arc::new(MemoryStore::new());
    let dir = Arc::new(CacheDir::new());
    let acquirer = Acquirer::new(config.clone(), store.clone(), None);
    let broadcaster = Broadcaster::from_config(&config.sync);

    tokio::spawn(janitor::run(
        Arc::clone(&dir),
        config.cache_idle_secs,
        config.cache_sweep_secs,
    ));

    serve(Arc::new(Origin::new(
        config,
        store,
        dir,
        acquirer,
        broadcaster,
    )))
    .await
}

fn arg_value(args: &[String], key: &str) -> Option<String> {
    args.windows(2).find(|w| w[0] == key).map(|w| w[1].clone())
}

fn print_usage() {
    println!(
        r#"facade

USAGE:
  facade serve [--config <origin.yaml>] [--listen 0.0.0.0:8080]
  facade version

NOTES:
  - Log level: RUST_LOG (default "info").
  - Config keys and defaults are documented in README.md."#
    );
}
