//! Cartage - content-addressed archive transfer node
//!
//! Imports files as DAGs and serves them as CARv1 archives over HTTP and
//! libp2p-tunnelled HTTP, with resumable downloads on the client side.

use cartage_core::{authorize, fetch, import_file, run_node, Action, Config};
use std::error::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let (config, action) = Config::from_cli()?;

    // Initialize logging
    init_logging(&config.log_level);

    match action {
        Action::Serve => {
            tracing::info!("Starting cartage node...");
            run_node(config).await?;
        }
        Action::Import(cmd) => {
            let summary = import_file(&config, &cmd).await?;
            println!("root: {}", summary.dag.root);
            println!("file size: {}", summary.dag.file_size);
            println!("archive size: {}", summary.archive_size);
        }
        Action::Authorize(cmd) => {
            let issued = authorize(&config, &cmd).await?;
            println!("token: {}", issued.token);
            println!("archive size: {}", issued.archive_size);
            println!("Authorization: {}", issued.authorization);
        }
        Action::Fetch(cmd) => {
            let outcome = fetch(&cmd).await?;
            println!(
                "{} bytes written to {}",
                outcome.bytes_received,
                outcome.path.display()
            );
        }
    }

    Ok(())
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(level))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
