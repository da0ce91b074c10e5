//! Treasury and swap core entrypoint.
//!
//! Loads configuration rooted at `BLOCKHOST_CONFIG_DIR`, loads the
//! addressbook, connects a single [`rpc::ChainProvider`], and runs the
//! scheduler's tick loop until a shutdown signal is observed.

mod address;
mod addressbook;
mod amount;
mod config;
mod fund;
mod logging;
mod persist;
mod rpc;
mod scheduler;
mod sig_down;
mod subscription;
mod swap;
mod token;
mod wallet;

use std::sync::Arc;

use config::{FundManagerConfig, RevenueShareConfig, Web3Config, config_dir};
use fund::FundManager;
use rpc::ChainProvider;
use scheduler::Scheduler;
use sig_down::SigDown;
use swap::SwapConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init();

    let dir = config_dir();
    let fund_config = FundManagerConfig::load(&dir).await?;
    let revenue_config = RevenueShareConfig::load(&dir).await?;
    let web3_config = Web3Config::load(&dir).await?;

    let addressbook_path = dir.join("addressbook.json");
    let book = Arc::new(addressbook::Addressbook::load(&addressbook_path).await);

    let chain = Arc::new(ChainProvider::new(web3_config.rpc_url.clone()));

    let swap_config = SwapConfig {
        native_swap_contract: web3_config.native_swap_contract,
        amm_router: web3_config.amm.as_ref().map(|a| a.router),
        amm_factory: web3_config.amm.as_ref().map(|a| a.factory),
    };

    let state_path = dir.join("fund-state.json");
    let fund_manager = FundManager::new(
        chain.clone(),
        fund_config.clone(),
        revenue_config,
        web3_config.subscription_contract,
        swap_config,
        web3_config.chain_id.clone(),
        state_path.clone(),
    );

    let scheduler = Scheduler::new(fund_manager, fund_config, state_path);
    let sig_down = SigDown::try_new()?;

    scheduler.run(book, &sig_down).await;
    drop(scheduler);

    Arc::try_unwrap(chain)
        .map(ChainProvider::close)
        .unwrap_or_else(|_| tracing::warn!("chain provider still has outstanding references at shutdown"));

    Ok(())
}
