//! Swap Router (Component F): selects a route between native and fungible
//! tokens and drives it to completion.
//!
//! Three routes, chosen purely from the pair of token identifiers:
//! - native -> fungible: [`NativeBuy`], a two-phase reserve/wait/execute flow.
//! - fungible -> native: [`NativeSell`], a list-and-poll liquidity listing.
//! - fungible -> fungible: [`Amm`], a single simulate-then-send call.
//! - native -> native is rejected outright.
//!
//! Every route applies the same slippage tolerance and every submission goes
//! through the crate-wide simulate-then-send pattern; errors abort the
//! in-flight swap immediately and propagate to the caller (no partial
//! recovery, unlike the Fund Manager's per-step isolation).

use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::U256;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::address::InternalAddress;
use crate::amount::{self, AmountError};
use crate::rpc::{Chain, DEFAULT_MAX_SAT_TO_SPEND, RpcError, SendSigned};
use crate::subscription::{SubscriptionClient, SubscriptionError};
use crate::token::{TokenAdapter, TokenError};
use crate::wallet::Wallet;

/// Slippage tolerance applied to every quoted route: 100 bps = 1%.
pub const SLIPPAGE_BPS: u64 = 100;
const BPS_DENOM: u64 = 10_000;

/// Native-Buy polling cadence and hard timeout (spec §4.F, §5).
const NATIVE_BUY_POLL_INTERVAL: Duration = Duration::from_secs(3);
const NATIVE_BUY_MAX_POLLS: u32 = 200; // 200 * 3s = 10 minutes.

/// Native-Sell polling cadence and informational timeout.
const NATIVE_SELL_POLL_INTERVAL: Duration = Duration::from_secs(10);
const NATIVE_SELL_MAX_POLLS: u32 = 180; // 180 * 10s = 30 minutes.

/// AMM deadline window, in blocks, added to the current block height.
const AMM_DEADLINE_BLOCKS: u64 = 20;

/// A token identifier as it appears in a swap request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenId {
    Native,
    Stable,
    Address(InternalAddress),
}

impl TokenId {
    pub fn parse(s: &str) -> Result<Self, SwapError> {
        match s {
            "btc" | "native" => Ok(TokenId::Native),
            "stable" => Ok(TokenId::Stable),
            other => other
                .parse::<InternalAddress>()
                .map(TokenId::Address)
                .map_err(|_| SwapError::InvalidToken(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum SwapError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error(transparent)]
    Amount(#[from] AmountError),
    #[error("not a recognized token identifier: {0}")]
    InvalidToken(String),
    #[error("native-to-native swaps are rejected")]
    NativeToNative,
    #[error("no liquidity for this route")]
    NoLiquidity,
    #[error("amount exceeds wallet balance")]
    InsufficientBalance,
    #[error("reserve call failed: {0}")]
    ReserveFailed(String),
    #[error("timed out waiting for the next block")]
    NextBlockTimeout,
    #[error("swap execution failed: {0}")]
    SwapExecFailed(String),
    #[error("AMM router/factory is not configured")]
    AmmUnavailable,
}

/// Addresses of the native-swap and (optional) AMM contracts, resolved from
/// `web3-defaults.yaml`.
#[derive(Debug, Clone)]
pub struct SwapConfig {
    pub native_swap_contract: InternalAddress,
    pub amm_router: Option<InternalAddress>,
    pub amm_factory: Option<InternalAddress>,
}

/// Native-Buy's two-phase protocol state, exposed for observability; the
/// protocol itself is not crash-safe (see spec §5) so this is descriptive
/// only, not resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeBuyState {
    Idle,
    Reserving,
    WaitingBlock,
    Executing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeSellState {
    Idle,
    Listing,
    Polling,
    Consumed,
    TimedOut,
}

/// The outcome of a driven-to-completion swap.
#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub tx_hash: String,
    pub expected_out: U256,
    pub min_out: U256,
}

/// `expected * (10_000 - slippage_bps) / 10_000`, integer division.
fn apply_slippage(expected: U256) -> U256 {
    expected * U256::from(BPS_DENOM - SLIPPAGE_BPS) / U256::from(BPS_DENOM)
}

/// Routes and drives a swap to completion for `(amount_str, from, to, wallet)`.
pub struct SwapRouter<C> {
    chain: Arc<C>,
    config: SwapConfig,
    network: String,
}

impl<C: Chain> SwapRouter<C> {
    pub fn new(chain: Arc<C>, config: SwapConfig, network: impl Into<String>) -> Self {
        Self {
            chain,
            config,
            network: network.into(),
        }
    }

    async fn resolve_token(&self, id: &TokenId, subscription: &SubscriptionClient<C>) -> Result<InternalAddress, SwapError> {
        match id {
            TokenId::Native => Ok(InternalAddress::zero()),
            TokenId::Address(a) => Ok(*a),
            TokenId::Stable => {
                let token = subscription.get_payment_token().await?;
                if token.is_zero() {
                    return Err(SwapError::SwapExecFailed("payment token is unset".to_string()));
                }
                Ok(token)
            }
        }
    }

    /// Routes `(amount_str, from, to, wallet)` and drives it to completion.
    pub async fn swap(
        &self,
        amount_str: &str,
        from: &TokenId,
        to: &TokenId,
        wallet: &Wallet,
        subscription: &SubscriptionClient<C>,
    ) -> Result<SwapOutcome, SwapError> {
        match (from, to) {
            (TokenId::Native, TokenId::Native) => Err(SwapError::NativeToNative),
            (TokenId::Native, _) => {
                let token = self.resolve_token(to, subscription).await?;
                let sats_in = amount::parse_units(amount_str, 8)?;
                self.native_buy(token, sats_in, wallet).await
            }
            (_, TokenId::Native) => {
                let token = self.resolve_token(from, subscription).await?;
                self.native_sell(token, amount_str, wallet).await
            }
            (_, _) => {
                let from_token = self.resolve_token(from, subscription).await?;
                let to_token = self.resolve_token(to, subscription).await?;
                self.amm_swap(from_token, to_token, amount_str, wallet).await
            }
        }
    }

    /// Two-phase native -> fungible swap (spec §4.F).
    async fn native_buy(
        &self,
        token: InternalAddress,
        sats_in: U256,
        wallet: &Wallet,
    ) -> Result<SwapOutcome, SwapError> {
        let mut state = NativeBuyState::Idle;
        debug!(?state, "native-buy starting");

        let quote: NativeBuyQuote = self.simulate_read(
            "getReserveQuote",
            vec![json!({
                "contract": self.config.native_swap_contract.to_string(),
                "token": token.to_string(),
                "satsIn": sats_in.to_string(),
            })],
        ).await?;
        if quote.tokens_out_expected.is_zero() {
            return Err(SwapError::NoLiquidity);
        }
        let min_tokens_out = apply_slippage(quote.tokens_out_expected);

        state = NativeBuyState::Reserving;
        let outcome = self
            .chain
            .simulate(
                "reserve",
                vec![json!({
                    "contract": self.config.native_swap_contract.to_string(),
                    "token": token.to_string(),
                    "satsIn": sats_in.to_string(),
                    "minTokensOut": min_tokens_out.to_string(),
                    "forward": 1,
                })],
            )
            .await?;
        let sendable = outcome.into_result(SwapError::ReserveFailed)?;

        let pre_block = self.chain.get_block_number().await?;

        let max_sat_to_spend = sats_in
            .checked_add(U256::from(100_000u64))
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(u64::MAX);
        let request = SendSigned {
            sendable: &sendable,
            signer: wallet.classical_signer_id(),
            mldsa_signer: wallet.mldsa_signer_id(),
            refund_to: wallet.internal_address(),
            max_sat_to_spend,
            network: &self.network,
        };
        self.chain.send_signed(request).await?;

        state = NativeBuyState::WaitingBlock;
        self.wait_for_next_block(pre_block).await?;

        state = NativeBuyState::Executing;
        let outcome = self
            .chain
            .simulate(
                "swap",
                vec![json!({ "contract": self.config.native_swap_contract.to_string(), "token": token.to_string() })],
            )
            .await?;
        let sendable = outcome.into_result(SwapError::SwapExecFailed)?;
        let request = SendSigned {
            sendable: &sendable,
            signer: wallet.classical_signer_id(),
            mldsa_signer: wallet.mldsa_signer_id(),
            refund_to: wallet.internal_address(),
            max_sat_to_spend: DEFAULT_MAX_SAT_TO_SPEND,
            network: &self.network,
        };
        let tx_hash = self.chain.send_signed(request).await?;

        state = NativeBuyState::Done;
        debug!(?state, "native-buy complete");
        Ok(SwapOutcome {
            tx_hash,
            expected_out: quote.tokens_out_expected,
            min_out: min_tokens_out,
        })
    }

    async fn wait_for_next_block(&self, pre_block: u64) -> Result<(), SwapError> {
        for _ in 0..NATIVE_BUY_MAX_POLLS {
            tokio::time::sleep(NATIVE_BUY_POLL_INTERVAL).await;
            let current = self.chain.get_block_number().await?;
            if current > pre_block {
                return Ok(());
            }
        }
        Err(SwapError::NextBlockTimeout)
    }

    /// List-and-poll fungible -> native swap (spec §4.F).
    async fn native_sell(
        &self,
        token: InternalAddress,
        amount_str: &str,
        wallet: &Wallet,
    ) -> Result<SwapOutcome, SwapError> {
        let mut state = NativeSellState::Idle;
        debug!(?state, "native-sell starting");

        let adapter = TokenAdapter::new(self.chain.clone(), token, self.network.clone());
        let metadata = adapter.metadata().await?;
        let amount = amount::parse_units(amount_str, metadata.decimals)?;
        let balance = adapter.balance_of(&wallet.internal_address()).await?;
        if amount > balance {
            return Err(SwapError::InsufficientBalance);
        }

        adapter
            .ensure_allowance(wallet, &self.config.native_swap_contract, amount)
            .await?;

        let receiver_str = wallet.external_address().to_string();
        let receiver_script = wallet.internal_address().to_string();

        state = NativeSellState::Listing;
        let outcome = self
            .chain
            .simulate(
                "listLiquidity",
                vec![json!({
                    "contract": self.config.native_swap_contract.to_string(),
                    "token": token.to_string(),
                    "receiverScript": receiver_script,
                    "receiverStr": receiver_str,
                    "amount": amount.to_string(),
                    "priority": false,
                })],
            )
            .await?;
        let sendable = outcome.into_result(SwapError::ReserveFailed)?;
        let request = SendSigned {
            sendable: &sendable,
            signer: wallet.classical_signer_id(),
            mldsa_signer: wallet.mldsa_signer_id(),
            refund_to: wallet.internal_address(),
            max_sat_to_spend: DEFAULT_MAX_SAT_TO_SPEND,
            network: &self.network,
        };
        let tx_hash = self.chain.send_signed(request).await?;

        state = NativeSellState::Polling;
        for _ in 0..NATIVE_SELL_MAX_POLLS {
            tokio::time::sleep(NATIVE_SELL_POLL_INTERVAL).await;
            let details: ProviderDetails = self
                .simulate_read(
                    "getProviderDetails",
                    vec![json!({ "contract": self.config.native_swap_contract.to_string(), "token": token.to_string() })],
                )
                .await?;
            if details.liquidity.is_zero() {
                state = NativeSellState::Consumed;
                debug!(?state, "native-sell listing fully consumed");
                return Ok(SwapOutcome {
                    tx_hash,
                    expected_out: amount,
                    min_out: amount,
                });
            }
        }

        state = NativeSellState::TimedOut;
        info!(?state, "native-sell listing still live after informational timeout");
        Ok(SwapOutcome {
            tx_hash,
            expected_out: amount,
            min_out: amount,
        })
    }

    /// Single-call fungible -> fungible AMM swap (spec §4.F).
    async fn amm_swap(
        &self,
        from_token: InternalAddress,
        to_token: InternalAddress,
        amount_str: &str,
        wallet: &Wallet,
    ) -> Result<SwapOutcome, SwapError> {
        let (router, _factory) = match (self.config.amm_router, self.config.amm_factory) {
            (Some(r), Some(f)) => (r, f),
            _ => return Err(SwapError::AmmUnavailable),
        };

        let adapter = TokenAdapter::new(self.chain.clone(), from_token, self.network.clone());
        let metadata = adapter.metadata().await?;
        let amount_in = amount::parse_units(amount_str, metadata.decimals)?;

        let quote: AmountsOutQuote = self
            .simulate_read(
                "getAmountsOut",
                vec![json!({
                    "router": router.to_string(),
                    "amountIn": amount_in.to_string(),
                    "path": [from_token.to_string(), to_token.to_string()],
                })],
            )
            .await?;
        let expected_out = *quote.amounts_out.last().ok_or(SwapError::NoLiquidity)?;
        if expected_out.is_zero() {
            return Err(SwapError::NoLiquidity);
        }
        let min_out = apply_slippage(expected_out);

        adapter.ensure_allowance(wallet, &router, amount_in).await?;

        let current_block = self.chain.get_block_number().await?;
        let deadline = current_block + AMM_DEADLINE_BLOCKS;

        let outcome = self
            .chain
            .simulate(
                "swapExactTokensForTokensSupportingFeeOnTransferTokens",
                vec![json!({
                    "router": router.to_string(),
                    "amountIn": amount_in.to_string(),
                    "amountOutMin": min_out.to_string(),
                    "path": [from_token.to_string(), to_token.to_string()],
                    "to": wallet.internal_address().to_string(),
                    "deadline": deadline,
                })],
            )
            .await?;
        let sendable = outcome.into_result(SwapError::SwapExecFailed)?;
        let request = SendSigned {
            sendable: &sendable,
            signer: wallet.classical_signer_id(),
            mldsa_signer: wallet.mldsa_signer_id(),
            refund_to: wallet.internal_address(),
            max_sat_to_spend: DEFAULT_MAX_SAT_TO_SPEND,
            network: &self.network,
        };
        let tx_hash = self.chain.send_signed(request).await?;

        Ok(SwapOutcome {
            tx_hash,
            expected_out,
            min_out,
        })
    }

    async fn simulate_read<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, SwapError> {
        let outcome = self.chain.simulate(method, params).await?;
        let sendable = outcome.into_result(SwapError::SwapExecFailed)?;
        let value = sendable.params.first().cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| {
            warn!(error = %e, method, "failed to decode quote response");
            SwapError::SwapExecFailed(e.to_string())
        })
    }
}

#[derive(Debug, Deserialize)]
struct NativeBuyQuote {
    #[serde(rename = "tokensOutExpected")]
    tokens_out_expected: U256,
}

#[derive(Debug, Deserialize)]
struct ProviderDetails {
    liquidity: U256,
}

#[derive(Debug, Deserialize)]
struct AmountsOutQuote {
    #[serde(rename = "amountsOut")]
    amounts_out: Vec<U256>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slippage_matches_s5() {
        // S5: expected = 1_000, min_out = 990 at 1% slippage.
        assert_eq!(apply_slippage(U256::from(1_000u64)), U256::from(990u64));
    }

    #[test]
    fn slippage_matches_s6() {
        // S6: expected = 95, min_out = 94 (95 * 9900 / 10000, integer).
        assert_eq!(apply_slippage(U256::from(95u64)), U256::from(94u64));
    }

    #[test]
    fn token_id_parses_known_aliases() {
        assert_eq!(TokenId::parse("btc").unwrap(), TokenId::Native);
        assert_eq!(TokenId::parse("native").unwrap(), TokenId::Native);
        assert_eq!(TokenId::parse("stable").unwrap(), TokenId::Stable);
    }

    #[test]
    fn token_id_rejects_garbage() {
        assert!(TokenId::parse("not-an-address").is_err());
    }

    use crate::rpc::mock::MockChain;
    use crate::wallet::derive_wallet;

    fn test_wallet() -> Wallet {
        derive_wallet("abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about").unwrap()
    }

    fn test_router(chain: MockChain) -> SwapRouter<MockChain> {
        SwapRouter::new(
            Arc::new(chain),
            SwapConfig {
                native_swap_contract: InternalAddress::zero(),
                amm_router: None,
                amm_factory: None,
            },
            "testnet",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn native_buy_waits_for_a_strictly_greater_block() {
        // Invariant 6: swap must not fire until the observed block height is
        // strictly greater than the height captured at reserve time.
        let chain = MockChain::with_blocks(vec![100, 100, 100, 101]);
        let router = test_router(chain);
        router.wait_for_next_block(100).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn native_buy_times_out_if_block_never_advances() {
        let chain = MockChain::with_blocks(vec![100]);
        let router = test_router(chain);
        let result = router.wait_for_next_block(100).await;
        assert!(matches!(result, Err(SwapError::NextBlockTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn full_native_buy_flow_against_mock_chain() {
        let chain = MockChain::with_blocks(vec![50, 50, 51]);
        chain.stub_simulate_properties(
            "getReserveQuote",
            json!({ "tokensOutExpected": "1000" }),
        );
        chain.stub_simulate_properties("reserve", json!({}));
        chain.stub_simulate_properties("swap", json!({}));
        let router = test_router(chain);
        let wallet = test_wallet();

        let outcome = router
            .native_buy(InternalAddress::zero(), U256::from(10_000u64), &wallet)
            .await
            .unwrap();

        assert_eq!(outcome.expected_out, U256::from(1_000u64));
        assert_eq!(outcome.min_out, U256::from(990u64));
    }
}
