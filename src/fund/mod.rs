//! Fund Manager (Component G): the five-step periodic treasury pipeline,
//! composed over the Addressbook, Wallet Resolver, Token Adapter,
//! Subscription Contract Client, and Swap Router.
//!
//! Each step runs in its own recovery scope: a failure in step N is logged
//! and step N+1 still runs (spec §4.G, §7) — this is the opposite discipline
//! from the Swap Router, where an error aborts the whole operation.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::addressbook::{Addressbook, AddressbookError};
use crate::amount::{self, BpsRecipient};
use crate::config::{FundManagerConfig, RevenueShareConfig};
use crate::persist::write_json_atomic;
use crate::rpc::Chain;
use crate::subscription::{SubscriptionClient, SubscriptionError};
use crate::swap::{SwapConfig, SwapError, SwapRouter, TokenId};
use crate::token::{TokenAdapter, TokenError};

/// Off-chain counters persisted between cycles: `{last_fund_cycle_ms,
/// last_gas_check_ms}`. Written atomically by this component only.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FundState {
    #[serde(rename = "last_fund_cycle")]
    pub last_fund_cycle_ms: u64,
    #[serde(rename = "last_gas_check")]
    pub last_gas_check_ms: u64,
}

impl FundState {
    pub async fn load(path: &Path) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        write_json_atomic(path, self).await
    }
}

#[derive(Debug, Error)]
pub enum FundError {
    #[error(transparent)]
    Addressbook(#[from] AddressbookError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Swap(#[from] SwapError),
    #[error("amount error: {0}")]
    Amount(String),
}

/// Guards a single step shared by two independent call sites (the fund
/// cycle's step 2 and the gas check's own top-up), so the two jobs "never
/// overlap a shared step" even when they run concurrently (spec §5). Backed
/// by an `Arc` so cloning a [`FundManager`] shares one flag, not a copy.
struct HotGasGuard {
    flag: Arc<AtomicBool>,
}

impl HotGasGuard {
    fn try_claim(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| HotGasGuard { flag: flag.clone() })
    }
}

impl Drop for HotGasGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Everything the pipeline needs beyond the chain client itself.
pub struct FundManager<C> {
    chain: Arc<C>,
    config: FundManagerConfig,
    revenue: RevenueShareConfig,
    subscription_contract: crate::address::InternalAddress,
    swap_config: SwapConfig,
    network: String,
    state_path: PathBuf,
    top_up_hot_gas_in_progress: Arc<AtomicBool>,
}

impl<C> Clone for FundManager<C> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            config: self.config.clone(),
            revenue: self.revenue.clone(),
            subscription_contract: self.subscription_contract,
            swap_config: self.swap_config.clone(),
            network: self.network.clone(),
            state_path: self.state_path.clone(),
            top_up_hot_gas_in_progress: self.top_up_hot_gas_in_progress.clone(),
        }
    }
}

impl<C: Chain> FundManager<C> {
    pub fn new(
        chain: Arc<C>,
        config: FundManagerConfig,
        revenue: RevenueShareConfig,
        subscription_contract: crate::address::InternalAddress,
        swap_config: SwapConfig,
        network: impl Into<String>,
        state_path: PathBuf,
    ) -> Self {
        Self {
            chain,
            config,
            revenue,
            subscription_contract,
            swap_config,
            network: network.into(),
            state_path,
            top_up_hot_gas_in_progress: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Runs the five-step pipeline once. Never returns an error that would
    /// abort the caller's scheduler tick — every step isolates its own
    /// failure and logs it; this only returns `Err` for setup failures that
    /// precede step 1 (e.g. the addressbook has no "hot"/"server"/"admin"
    /// roles at all).
    pub async fn run_cycle(&self, book: &Addressbook) -> Result<(), FundError> {
        let hot = book.resolve_wallet("hot").await?;
        let server = book.resolve_wallet("server").await?;
        let admin_entry = book.get("admin").ok_or_else(|| AddressbookError::NoRole("admin".to_string()))?;
        let admin_address = admin_entry.address;

        let subscription =
            SubscriptionClient::new(self.chain.clone(), self.subscription_contract, self.network.clone());

        if let Err(e) = self.step_withdraw(&server, &hot, &subscription).await {
            warn!(error = %e, "fund cycle step 1 (withdraw) failed");
        }

        let payment_token = match subscription.get_payment_token().await {
            Ok(t) if !t.is_zero() => Some(t),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "could not read payment token, skipping token-denominated steps");
                None
            }
        };

        if let Err(e) = self.step_top_up_hot_native(&server, &hot).await {
            warn!(error = %e, "fund cycle step 2 (top-up hot native) failed");
        }

        if let Some(token) = payment_token {
            let adapter = TokenAdapter::new(self.chain.clone(), token, self.network.clone());

            if let Err(e) = self.step_top_up_server_buffer(&adapter, &hot, &server).await {
                warn!(error = %e, "fund cycle step 3 (top-up server buffer) failed");
            }

            if let Err(e) = self.step_distribute_revenue(&adapter, &hot, book).await {
                warn!(error = %e, "fund cycle step 4 (revenue distribution) failed");
            }

            if let Err(e) = self.step_sweep_remainder(&adapter, &hot, &admin_address).await {
                warn!(error = %e, "fund cycle step 5 (sweep remainder) failed");
            }
        }

        Ok(())
    }

    /// Step 1: withdraw the contract's payment-token balance to hot, if the
    /// payment token is set and the contract holds at least the configured
    /// minimum.
    async fn step_withdraw(
        &self,
        server: &crate::wallet::Wallet,
        hot: &crate::wallet::Wallet,
        subscription: &SubscriptionClient<C>,
    ) -> Result<(), FundError> {
        let token = subscription.get_payment_token().await?;
        if token.is_zero() {
            return Ok(());
        }
        let adapter = TokenAdapter::new(self.chain.clone(), token, self.network.clone());
        let contract_balance = adapter.balance_of(&self.subscription_contract).await?;
        if contract_balance < U256::from(self.config.min_withdrawal_sats) {
            return Ok(());
        }
        subscription.withdraw(server, &hot.internal_address()).await?;
        info!(amount = %contract_balance, "withdrew accrued revenue to hot wallet");
        Ok(())
    }

    /// Step 2: top up the hot wallet's native balance to the configured
    /// target, requiring the server hold at least twice what's needed. Shared
    /// by the fund cycle and the gas check; guarded so the two can never run
    /// this step concurrently against each other (spec §5) even though they
    /// are otherwise free to interleave.
    async fn step_top_up_hot_native(
        &self,
        server: &crate::wallet::Wallet,
        hot: &crate::wallet::Wallet,
    ) -> Result<(), FundError> {
        let Some(_guard) = HotGasGuard::try_claim(&self.top_up_hot_gas_in_progress) else {
            info!("top-up-hot-wallet-gas already in progress elsewhere, skipping this tick");
            return Ok(());
        };
        let target = U256::from(self.config.hot_wallet_gas_sats);
        let hot_balance = self.chain.get_balance(&hot.internal_address()).await.map_err(TokenError::from)?;
        if hot_balance >= target {
            return Ok(());
        }
        let needed = target - hot_balance;
        let server_balance = self.chain.get_balance(&server.internal_address()).await.map_err(TokenError::from)?;
        if server_balance < needed * U256::from(2u8) {
            return Err(FundError::Amount("server native balance below 2x required top-up".to_string()));
        }
        self.send_native(server, &hot.internal_address(), needed).await
    }

    /// Step 3: top up the server wallet's payment-token buffer from hot.
    async fn step_top_up_server_buffer(
        &self,
        adapter: &TokenAdapter<C>,
        hot: &crate::wallet::Wallet,
        server: &crate::wallet::Wallet,
    ) -> Result<(), FundError> {
        let target = U256::from(self.config.server_stablecoin_buffer_sats);
        let server_balance = adapter.balance_of(&server.internal_address()).await?;
        if server_balance >= target {
            return Ok(());
        }
        let needed = target - server_balance;
        let hot_balance = adapter.balance_of(&hot.internal_address()).await?;
        if hot_balance < needed {
            return Err(FundError::Amount("hot token balance insufficient for server buffer top-up".to_string()));
        }
        adapter.transfer(hot, &server.internal_address(), needed).await?;
        Ok(())
    }

    /// Step 4: distribute the hot wallet's token balance by basis points.
    async fn step_distribute_revenue(
        &self,
        adapter: &TokenAdapter<C>,
        hot: &crate::wallet::Wallet,
        book: &Addressbook,
    ) -> Result<(), FundError> {
        if !self.revenue.enabled || self.revenue.recipients.is_empty() {
            return Ok(());
        }
        let balance = adapter.balance_of(&hot.internal_address()).await?;
        let recipients: Vec<BpsRecipient<&str>> = self
            .revenue
            .recipients
            .iter()
            .map(|r| BpsRecipient { key: r.role.as_str(), bps: r.bps })
            .collect();
        let Some(shares) = amount::split_by_bps(balance, self.revenue.total_bps, &recipients) else {
            warn!("revenue share recipients do not sum to total_bps, skipping distribution");
            return Ok(());
        };
        for (role, share) in shares {
            let Some(entry) = book.get(role) else {
                warn!(role, "revenue recipient role not in addressbook, skipping");
                continue;
            };
            adapter.transfer(hot, &entry.address, share).await?;
        }
        Ok(())
    }

    /// Step 5: sweep whatever payment-token balance remains to admin.
    async fn step_sweep_remainder(
        &self,
        adapter: &TokenAdapter<C>,
        hot: &crate::wallet::Wallet,
        admin: &crate::address::InternalAddress,
    ) -> Result<(), FundError> {
        let remainder = adapter.balance_of(&hot.internal_address()).await?;
        if remainder.is_zero() {
            return Ok(());
        }
        adapter.transfer(hot, admin, remainder).await?;
        Ok(())
    }

    /// The lighter-cadence gas check: step 2 again, plus a conditional
    /// fungible -> native swap when the server's native balance is low.
    pub async fn run_gas_check(&self, book: &Addressbook) -> Result<(), FundError> {
        let server = book.resolve_wallet("server").await?;
        let hot = book.resolve_wallet("hot").await?;

        if let Err(e) = self.step_top_up_hot_native(&server, &hot).await {
            warn!(error = %e, "gas check top-up-hot step failed");
        }

        let subscription =
            SubscriptionClient::new(self.chain.clone(), self.subscription_contract, self.network.clone());
        let payment_token = subscription.get_payment_token().await.ok().filter(|t| !t.is_zero());

        let Some(token) = payment_token else { return Ok(()) };

        let server_native = match self.chain.get_balance(&server.internal_address()).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "gas check could not read server native balance");
                return Ok(());
            }
        };
        if server_native >= U256::from(self.config.gas_low_threshold_sats) {
            return Ok(());
        }

        let adapter = TokenAdapter::new(self.chain.clone(), token, self.network.clone());
        let server_token_balance = adapter.balance_of(&server.internal_address()).await?;
        if server_token_balance.is_zero() {
            return Ok(());
        }
        let swap_amount = server_token_balance.min(U256::from(self.config.gas_swap_amount_sats));

        let router = SwapRouter::new(self.chain.clone(), self.swap_config.clone(), self.network.clone());
        let decimals = adapter.metadata().await?.decimals;
        let amount_str = amount::format_units(swap_amount, decimals);
        router
            .swap(&amount_str, &TokenId::Address(token), &TokenId::Native, &server, &subscription)
            .await?;
        Ok(())
    }

    /// Sends `amount` sats of the native coin from `from` to `to`. Plain
    /// UTXO construction is out of scope (spec §1); this forwards to the
    /// chain's simulate-then-send path the same way every other write does.
    async fn send_native(
        &self,
        from: &crate::wallet::Wallet,
        to: &crate::address::InternalAddress,
        amount: U256,
    ) -> Result<(), FundError> {
        let outcome = self
            .chain
            .simulate(
                "sendNative",
                vec![serde_json::json!({ "to": to.to_string(), "amount": amount.to_string() })],
            )
            .await
            .map_err(TokenError::from)?;
        let sendable = outcome.into_result(TokenError::TransferReverted)?;
        let request = crate::rpc::SendSigned {
            sendable: &sendable,
            signer: from.classical_signer_id(),
            mldsa_signer: from.mldsa_signer_id(),
            refund_to: from.internal_address(),
            max_sat_to_spend: crate::rpc::DEFAULT_MAX_SAT_TO_SPEND,
            network: &self.network,
        };
        self.chain.send_signed(request).await.map_err(TokenError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hot_gas_guard_second_claim_is_noop_while_held() {
        let flag = Arc::new(AtomicBool::new(false));
        let first = HotGasGuard::try_claim(&flag);
        assert!(first.is_some());
        assert!(HotGasGuard::try_claim(&flag).is_none());
        drop(first);
        assert!(HotGasGuard::try_claim(&flag).is_some());
    }

    #[test]
    fn fund_state_defaults_to_zero() {
        let state = FundState::default();
        assert_eq!(state.last_fund_cycle_ms, 0);
        assert_eq!(state.last_gas_check_ms, 0);
    }

    #[tokio::test]
    async fn fund_state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fund-state.json");
        let state = FundState {
            last_fund_cycle_ms: 123,
            last_gas_check_ms: 456,
        };
        state.save(&path).await.unwrap();
        let loaded = FundState::load(&path).await;
        assert_eq!(loaded, state);
    }

    #[tokio::test]
    async fn fund_state_load_missing_file_is_default() {
        let loaded = FundState::load(Path::new("/nonexistent/fund-state.json")).await;
        assert_eq!(loaded, FundState::default());
    }

    use crate::rpc::mock::MockChain;
    use crate::wallet::derive_wallet;

    fn manager(chain: MockChain) -> FundManager<MockChain> {
        FundManager::new(
            Arc::new(chain),
            FundManagerConfig::default(),
            RevenueShareConfig::default(),
            "0x1111111111111111111111111111111111111111111111111111111111111a"
                .parse()
                .unwrap(),
            SwapConfig {
                native_swap_contract: "0x1111111111111111111111111111111111111111111111111111111111111a"
                    .parse()
                    .unwrap(),
                amm_router: None,
                amm_factory: None,
            },
            "testnet",
            PathBuf::from("/tmp/unused-fund-state.json"),
        )
    }

    #[tokio::test]
    async fn top_up_hot_native_requires_server_to_hold_double_the_shortfall() {
        let hot = derive_wallet("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about").unwrap();
        let server = derive_wallet("legal winner thank year wave sausage worth useful legal winner thank yellow").unwrap();

        let chain = MockChain::new();
        chain.stub_balance(&hot.internal_address(), U256::from(0u64));
        chain.stub_balance(&server.internal_address(), U256::from(50_000u64)); // < 2x100_000 needed
        let fund = manager(chain);

        let result = fund.step_top_up_hot_native(&server, &hot).await;
        assert!(matches!(result, Err(FundError::Amount(_))));
    }

    #[tokio::test]
    async fn top_up_hot_native_sends_the_shortfall_when_server_has_enough() {
        let hot = derive_wallet("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about").unwrap();
        let server = derive_wallet("legal winner thank year wave sausage worth useful legal winner thank yellow").unwrap();

        let chain = MockChain::new();
        chain.stub_balance(&hot.internal_address(), U256::from(0u64));
        chain.stub_balance(&server.internal_address(), U256::from(1_000_000u64));
        chain.stub_simulate_properties("sendNative", serde_json::json!({}));
        let fund = manager(chain);

        fund.step_top_up_hot_native(&server, &hot).await.unwrap();
    }
}
