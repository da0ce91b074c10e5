//! Uniform view over a fungible-token contract: balance, metadata, allowance,
//! transfer, and allowance top-up.
//!
//! Every write is simulate-then-send: an off-chain simulation yields either a
//! [`Sendable`] handle or a structured error; only on success is it signed
//! and submitted. A single [`send_signed`] helper centralizes the signing
//! parameters (`signer`, `mldsa_signer`, `refund_to`, `max_sat_to_spend`,
//! `network`) so every write path threads them identically.

use std::sync::Arc;

use alloy_primitives::U256;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::address::InternalAddress;
use crate::rpc::{Chain, DEFAULT_MAX_SAT_TO_SPEND, RpcError, SendSigned};
use crate::wallet::Wallet;

/// Errors from token reads and writes.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("token call failed: {0}")]
    TokenCallFailed(String),
    #[error("transfer reverted: {0}")]
    TransferReverted(String),
    #[error("pull-payment check failed: {0}")]
    PullTokensFailed(String),
}

/// Decimals and display symbol of a fungible token, queried at runtime.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenMetadata {
    pub decimals: u32,
    pub symbol: String,
}

/// A uniform query/transfer interface over a fungible-token contract.
#[derive(Clone)]
pub struct TokenAdapter<C> {
    chain: Arc<C>,
    token: InternalAddress,
    network: String,
}

impl<C: Chain> TokenAdapter<C> {
    pub fn new(chain: Arc<C>, token: InternalAddress, network: impl Into<String>) -> Self {
        Self {
            chain,
            token,
            network: network.into(),
        }
    }

    pub fn token(&self) -> InternalAddress {
        self.token
    }

    /// Base-unit balance of `owner`.
    pub async fn balance_of(&self, owner: &InternalAddress) -> Result<U256, TokenError> {
        let outcome = self
            .chain
            .simulate(
                "balanceOf",
                vec![json!({ "token": self.token.to_string(), "owner": owner.to_string() })],
            )
            .await?;
        let sendable = outcome.into_result(TokenError::TokenCallFailed)?;
        let value: BalanceView = decode_properties(&sendable)?;
        Ok(value.balance)
    }

    /// Token decimals and display symbol.
    pub async fn metadata(&self) -> Result<TokenMetadata, TokenError> {
        let outcome = self
            .chain
            .simulate("metadata", vec![json!({ "token": self.token.to_string() })])
            .await?;
        let sendable = outcome.into_result(TokenError::TokenCallFailed)?;
        decode_properties(&sendable)
    }

    /// Current allowance `owner` has granted to `spender`.
    pub async fn allowance(
        &self,
        owner: &InternalAddress,
        spender: &InternalAddress,
    ) -> Result<U256, TokenError> {
        let outcome = self
            .chain
            .simulate(
                "allowance",
                vec![json!({
                    "token": self.token.to_string(),
                    "owner": owner.to_string(),
                    "spender": spender.to_string(),
                })],
            )
            .await?;
        let sendable = outcome.into_result(TokenError::TokenCallFailed)?;
        let value: AllowanceView = decode_properties(&sendable)?;
        Ok(value.allowance)
    }

    /// Transfers `amount` base units from `wallet` to `to`.
    pub async fn transfer(
        &self,
        wallet: &Wallet,
        to: &InternalAddress,
        amount: U256,
    ) -> Result<String, TokenError> {
        let outcome = self
            .chain
            .simulate(
                "transfer",
                vec![json!({
                    "token": self.token.to_string(),
                    "to": to.to_string(),
                    "amount": amount.to_string(),
                })],
            )
            .await?;
        let sendable = outcome.into_result(TokenError::TransferReverted)?;
        check_transfer_result(&sendable)?;
        Ok(self.send_signed(&sendable, wallet, None).await?)
    }

    /// Ensures `spender`'s allowance from `wallet` covers `required`: queries
    /// the current allowance and, if short, submits `increaseAllowance` for
    /// exactly the missing delta. Never calls `setAllowance`.
    pub async fn ensure_allowance(
        &self,
        wallet: &Wallet,
        spender: &InternalAddress,
        required: U256,
    ) -> Result<Option<String>, TokenError> {
        let current = self.allowance(&wallet.internal_address(), spender).await?;
        if current >= required {
            return Ok(None);
        }
        let delta = required - current;
        let outcome = self
            .chain
            .simulate(
                "increaseAllowance",
                vec![json!({
                    "token": self.token.to_string(),
                    "spender": spender.to_string(),
                    "delta": delta.to_string(),
                })],
            )
            .await?;
        let sendable = outcome.into_result(TokenError::TokenCallFailed)?;
        Ok(Some(self.send_signed(&sendable, wallet, None).await?))
    }

    /// Signs and submits a previously simulated call, centralizing the
    /// signing parameters shared by every write in this module.
    async fn send_signed(
        &self,
        sendable: &crate::rpc::Sendable,
        wallet: &Wallet,
        max_sat: Option<u64>,
    ) -> Result<String, TokenError> {
        let refund_to = wallet.internal_address();
        let request = SendSigned {
            sendable,
            signer: wallet.classical_signer_id(),
            mldsa_signer: wallet.mldsa_signer_id(),
            refund_to,
            max_sat_to_spend: max_sat.unwrap_or(DEFAULT_MAX_SAT_TO_SPEND),
            network: &self.network,
        };
        Ok(self.chain.send_signed(request).await?)
    }
}

#[derive(Debug, Deserialize)]
struct BalanceView {
    balance: U256,
}

#[derive(Debug, Deserialize)]
struct AllowanceView {
    allowance: U256,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PullResult {
    Empty,
    Bool(bool),
}

/// Accepts either an empty return (legacy tokens) or a single boolean `true`
/// as proof of a successful pull-payment; any other shape fails
/// [`TokenError::PullTokensFailed`].
fn check_transfer_result(sendable: &crate::rpc::Sendable) -> Result<(), TokenError> {
    let Some(raw) = sendable.params.first() else {
        return Ok(());
    };
    if raw.is_null() {
        return Ok(());
    }
    match serde_json::from_value::<PullResult>(raw.clone()) {
        Ok(PullResult::Empty) | Ok(PullResult::Bool(true)) => Ok(()),
        Ok(PullResult::Bool(false)) => Err(TokenError::PullTokensFailed(
            "transfer returned false".to_string(),
        )),
        Err(_) => Err(TokenError::PullTokensFailed(
            "transfer returned an unexpected shape".to_string(),
        )),
    }
}

fn decode_properties<T: serde::de::DeserializeOwned>(
    sendable: &crate::rpc::Sendable,
) -> Result<T, TokenError> {
    let value = sendable
        .params
        .first()
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|e| TokenError::TokenCallFailed(e.to_string()))
}
