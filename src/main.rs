use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use certd::configs::Config;
use certd::logging;
use certd::server;
use certd::state::{self, FsStateHandler};
use certd::FsStore;

const DEFAULT_CONFIG_PATH: &str = "/etc/certd/certd.yaml";

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration '{}'", config_path))?;
    let _logging_guard = logging::init(config.debug, config.verbose)?;

    let server_config = &config.server;
    state::update_handler(Box::new(FsStateHandler::new(
        server_config.resolved_state_path(),
    )));

    let store_path = server_config.resolved_store_path();
    let store = if store_path.is_dir() {
        FsStore::open(&store_path)?
    } else {
        FsStore::init(&store_path)?
    };
    info!(store = %store.name(), "Certificate store ready");
    let store = Arc::new(store);

    let listen_address = server_config.listen_address()?;
    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(server::run(
        &listen_address,
        store,
        server_config.resolved_acme_config(),
    ))
}
