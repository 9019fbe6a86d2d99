use dotenv::dotenv;
use eyre::{eyre, WrapErr};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wallet_smith::{
    network::{NetworkId, NetworkProfile},
    utils::parse_address,
    wallet::{Config, WalletManager},
};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let network: NetworkId = dotenv::var("NETWORK")
        .unwrap_or_else(|_| "testnet".to_string())
        .parse()?;
    let mut profile = NetworkProfile::preset(network);
    if let Ok(rpc_url) = dotenv::var("RPC_URL") {
        profile.rpc_endpoint = rpc_url;
    }

    let config = config_from_env()?;
    let manager = WalletManager::connect(profile, config).await?;

    let status = manager.network_status().await?;
    info!(
        network = %network,
        chain_id = status.chain_id,
        block = status.block_number,
        gas_price = status.gas_price,
        "Connected"
    );

    let interrupt = manager.interrupt().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping");
            interrupt.trigger();
        }
    });

    for token in list_var("TOKEN_ADDRESSES") {
        match manager.add_token(&token).await {
            Ok(descriptor) => info!(token = %descriptor, "Token registered"),
            Err(e) => warn!(%token, error = %e, "Skipping token"),
        }
    }

    let accounts = list_var("WALLET_ADDRESSES")
        .iter()
        .map(|a| parse_address(a))
        .collect::<Result<Vec<_>, _>>()?;
    if accounts.is_empty() {
        return Err(eyre!("WALLET_ADDRESSES must list at least one address"));
    }

    for (account, snapshot) in accounts.iter().zip(manager.get_all_balances(&accounts).await) {
        match snapshot {
            Ok(snapshot) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
            Err(e) => warn!(account = %account, error = %e, "Balance query failed"),
        }
    }

    Ok(())
}

/// Builds the core configuration from environment variables, falling back
/// to defaults for anything unset.
fn config_from_env() -> eyre::Result<Config> {
    let mut config = Config::default();

    if let Ok(v) = dotenv::var("MAX_BATCH_SIZE") {
        config.max_batch_size = v.parse().wrap_err("MAX_BATCH_SIZE must be a positive number")?;
    }
    if let Ok(v) = dotenv::var("CONCURRENCY_LIMIT") {
        config.concurrency_limit = v
            .parse()
            .wrap_err("CONCURRENCY_LIMIT must be a positive number")?;
    }
    if let Ok(v) = dotenv::var("MAX_RETRIES") {
        config.retry.max_retries = v.parse().wrap_err("MAX_RETRIES must be a number")?;
    }
    if let Ok(v) = dotenv::var("RETRY_BASE_DELAY") {
        config.retry.base_delay = duration_var("RETRY_BASE_DELAY", &v)?;
    }
    if let Ok(v) = dotenv::var("MAX_TRANSACTION_TIMEOUT") {
        config.confirmation_timeout = duration_var("MAX_TRANSACTION_TIMEOUT", &v)?;
    }

    Ok(config)
}

/// Accepts humantime strings ("500ms", "3m") or plain seconds.
fn duration_var(name: &str, value: &str) -> eyre::Result<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).wrap_err_with(|| format!("{} is not a duration: {}", name, value))
}

fn list_var(name: &str) -> Vec<String> {
    dotenv::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
