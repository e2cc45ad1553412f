use anyhow::{Context, Result};
use certstorage::storage::{KeySpace, ObjectStoreBackend, StorageConfig};
use certstorage::LockOptions;
use tracing::{info, Level};

/// Opens the configured certificate storage, which runs the bucket
/// permission probe, and reports whether this instance can use it.
#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    info!("Checking certificate storage");

    let path = std::env::var("CERTSTORAGE_PATH")
        .context("CERTSTORAGE_PATH (bucket[/prefix]) is required")?;
    let storage_config = StorageConfig::from_env()?;
    let lock_options = LockOptions::from_env()?;

    if let StorageConfig::Local { path: root } = &storage_config {
        let bucket_dir = root.join(KeySpace::parse(&path).bucket());
        info!("Using local bucket directory: {:?}", bucket_dir);
        std::fs::create_dir_all(&bucket_dir)?;
    }

    let storage = ObjectStoreBackend::new(&storage_config, &path, lock_options)
        .await
        .with_context(|| format!("certificate storage at {path} is not usable"))?;

    info!(
        bucket = storage.bucket(),
        prefix = storage.prefix(),
        "Certificate storage is reachable and writable"
    );

    Ok(())
}
