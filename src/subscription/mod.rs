//! Typed wrapper over the subscription contract's admin/user writes and
//! reads (Component E), plus [`reference`] — an in-memory reference
//! implementation of the contract's state machine used as a test double for
//! the Fund Manager and Swap Router, since the chain itself is out of scope.
//!
//! Every write follows the crate-wide simulate-then-send pattern; every
//! `{error}` shape from simulation surfaces as a [`SubscriptionError`]
//! variant instead of being signed and sent.

pub mod reference;

use std::sync::Arc;

use alloy_primitives::U256;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::address::InternalAddress;
use crate::rpc::{Chain, DEFAULT_MAX_SAT_TO_SPEND, RpcError, SendSigned};
use crate::wallet::Wallet;

/// The chain's native day unit: one subscription "day" of `expires_at`.
pub const DAY_UNIT: u64 = 86_400;

/// Maximum number of days accepted in a single buy/extend call.
pub const MAX_DAYS: u64 = 36_500;

/// Per-query cap on `get_subscriptions_by_subscriber`'s `limit`.
pub const MAX_PAGE_LIMIT: u32 = 50;

/// Errors from subscription-contract reads and writes.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("plan not found: {0}")]
    PlanNotFound(U256),
    #[error("subscription not found: {0}")]
    SubscriptionNotFound(U256),
    #[error("subscription already cancelled: {0}")]
    AlreadyCancelled(U256),
    #[error("contract is not accepting subscriptions")]
    NotAcceptingSubscriptions,
    #[error("plan is not active: {0}")]
    PlanInactive(U256),
    #[error("days out of range: {0}")]
    DaysOutOfRange(u64),
    #[error("value does not fit in u64: {0}")]
    IdOverflow(U256),
    #[error("plan price must be non-zero")]
    ZeroPrice,
    #[error("payment token is unset")]
    PaymentTokenUnset,
    #[error("caller is not the contract deployer")]
    NotDeployer,
    #[error("pull-payment check failed: {0}")]
    PullTokensFailed(String),
    #[error("contract call failed: {0}")]
    CallFailed(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Plan {
    pub id: U256,
    pub name: String,
    pub price_per_day: U256,
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Subscription {
    pub id: U256,
    pub plan_id: U256,
    pub subscriber: InternalAddress,
    pub expires_at: U256,
    pub cancelled: bool,
    pub user_encrypted: String,
}

/// Converts a `u256`-shaped index value into a `u64`, enforcing the chain's
/// `requireSafeU64` boundary check. See spec invariant on `IdOverflow`.
pub(crate) fn require_safe_u64(value: U256) -> Result<u64, SubscriptionError> {
    value
        .try_into()
        .map_err(|_| SubscriptionError::IdOverflow(value))
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PullResult {
    Empty,
    Bool(bool),
}

/// Accepts an empty return or boolean `true` as proof of a successful pull
/// payment; any other shape (including boolean `false`) is `PullTokensFailed`.
fn check_pull_result(sendable: &crate::rpc::Sendable) -> Result<(), SubscriptionError> {
    let Some(raw) = sendable.params.first() else {
        return Ok(());
    };
    if raw.is_null() {
        return Ok(());
    }
    match serde_json::from_value::<PullResult>(raw.clone()) {
        Ok(PullResult::Empty) | Ok(PullResult::Bool(true)) => Ok(()),
        Ok(PullResult::Bool(false)) => {
            Err(SubscriptionError::PullTokensFailed("withdraw returned false".to_string()))
        }
        Err(_) => Err(SubscriptionError::PullTokensFailed(
            "withdraw returned an unexpected shape".to_string(),
        )),
    }
}

fn require_valid_days(days: u64) -> Result<(), SubscriptionError> {
    if days == 0 || days > MAX_DAYS {
        return Err(SubscriptionError::DaysOutOfRange(days));
    }
    Ok(())
}

/// Typed RPC client over the subscription contract.
#[derive(Clone)]
pub struct SubscriptionClient<C> {
    chain: Arc<C>,
    contract: InternalAddress,
    network: String,
}

impl<C: Chain> SubscriptionClient<C> {
    pub fn new(chain: Arc<C>, contract: InternalAddress, network: impl Into<String>) -> Self {
        Self {
            chain,
            contract,
            network: network.into(),
        }
    }

    async fn send_signed(
        &self,
        sendable: &crate::rpc::Sendable,
        wallet: &Wallet,
    ) -> Result<String, SubscriptionError> {
        let request = SendSigned {
            sendable,
            signer: wallet.classical_signer_id(),
            mldsa_signer: wallet.mldsa_signer_id(),
            refund_to: wallet.internal_address(),
            max_sat_to_spend: DEFAULT_MAX_SAT_TO_SPEND,
            network: &self.network,
        };
        Ok(self.chain.send_signed(request).await?)
    }

    async fn simulate_and_send(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
        wallet: &Wallet,
    ) -> Result<String, SubscriptionError> {
        let outcome = self.chain.simulate(method, params).await?;
        let sendable = outcome.into_result(SubscriptionError::CallFailed)?;
        self.send_signed(&sendable, wallet).await
    }

    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, SubscriptionError> {
        let outcome = self.chain.simulate(method, params).await?;
        let sendable = outcome.into_result(SubscriptionError::CallFailed)?;
        let value = sendable.params.first().cloned().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| SubscriptionError::CallFailed(e.to_string()))
    }

    fn contract_arg(&self) -> serde_json::Value {
        json!({ "contract": self.contract.to_string() })
    }

    // --- admin writes --- //

    pub async fn set_payment_token(
        &self,
        admin: &Wallet,
        token: &InternalAddress,
    ) -> Result<String, SubscriptionError> {
        self.simulate_and_send(
            "setPaymentToken",
            vec![json!({ "contract": self.contract.to_string(), "token": token.to_string() })],
            admin,
        )
        .await
    }

    pub async fn create_plan(
        &self,
        admin: &Wallet,
        name: &str,
        price: U256,
    ) -> Result<String, SubscriptionError> {
        if price.is_zero() {
            return Err(SubscriptionError::ZeroPrice);
        }
        self.simulate_and_send(
            "createPlan",
            vec![json!({ "contract": self.contract.to_string(), "name": name, "price": price.to_string() })],
            admin,
        )
        .await
    }

    pub async fn update_plan(
        &self,
        admin: &Wallet,
        id: U256,
        name: &str,
        price: U256,
        active: bool,
    ) -> Result<String, SubscriptionError> {
        if price.is_zero() {
            return Err(SubscriptionError::ZeroPrice);
        }
        self.simulate_and_send(
            "updatePlan",
            vec![json!({
                "contract": self.contract.to_string(),
                "id": id.to_string(),
                "name": name,
                "price": price.to_string(),
                "active": active,
            })],
            admin,
        )
        .await
    }

    pub async fn set_accepting(&self, admin: &Wallet, accepting: bool) -> Result<String, SubscriptionError> {
        self.simulate_and_send(
            "setAccepting",
            vec![json!({ "contract": self.contract.to_string(), "accepting": accepting })],
            admin,
        )
        .await
    }

    pub async fn set_grace(&self, admin: &Wallet, days: u64) -> Result<String, SubscriptionError> {
        self.simulate_and_send(
            "setGrace",
            vec![json!({ "contract": self.contract.to_string(), "days": days })],
            admin,
        )
        .await
    }

    pub async fn cancel_subscription(&self, admin: &Wallet, id: U256) -> Result<String, SubscriptionError> {
        self.simulate_and_send(
            "cancelSubscription",
            vec![json!({ "contract": self.contract.to_string(), "id": id.to_string() })],
            admin,
        )
        .await
    }

    /// Withdraws the contract's full payment-token balance to `to`. Rejects
    /// a zero destination before ever simulating the call.
    pub async fn withdraw(&self, admin: &Wallet, to: &InternalAddress) -> Result<String, SubscriptionError> {
        if to.is_zero() {
            return Err(SubscriptionError::CallFailed("withdraw to zero address rejected".into()));
        }
        let outcome = self
            .chain
            .simulate(
                "withdraw",
                vec![json!({ "contract": self.contract.to_string(), "to": to.to_string() })],
            )
            .await?;
        let sendable = outcome.into_result(SubscriptionError::CallFailed)?;
        check_pull_result(&sendable)?;
        self.send_signed(&sendable, admin).await
    }

    // --- user writes --- //

    pub async fn buy_subscription(
        &self,
        wallet: &Wallet,
        plan_id: U256,
        days: u64,
        user_encrypted: &str,
    ) -> Result<String, SubscriptionError> {
        require_valid_days(days)?;
        self.simulate_and_send(
            "buySubscription",
            vec![json!({
                "contract": self.contract.to_string(),
                "planId": plan_id.to_string(),
                "days": days,
                "userEncrypted": user_encrypted,
            })],
            wallet,
        )
        .await
    }

    pub async fn extend_subscription(
        &self,
        wallet: &Wallet,
        sub_id: U256,
        days: u64,
    ) -> Result<String, SubscriptionError> {
        require_valid_days(days)?;
        self.simulate_and_send(
            "extendSubscription",
            vec![json!({
                "contract": self.contract.to_string(),
                "subId": sub_id.to_string(),
                "days": days,
            })],
            wallet,
        )
        .await
    }

    // --- reads --- //

    pub async fn is_accepting(&self) -> Result<bool, SubscriptionError> {
        self.read("isAccepting", vec![self.contract_arg()]).await
    }

    pub async fn get_payment_token(&self) -> Result<InternalAddress, SubscriptionError> {
        self.read("getPaymentToken", vec![self.contract_arg()]).await
    }

    pub async fn get_grace(&self) -> Result<u64, SubscriptionError> {
        self.read("getGrace", vec![self.contract_arg()]).await
    }

    pub async fn get_plan(&self, id: U256) -> Result<Plan, SubscriptionError> {
        self.read("getPlan", vec![json!({ "contract": self.contract.to_string(), "id": id.to_string() })])
            .await
    }

    pub async fn get_subscription(&self, id: U256) -> Result<Subscription, SubscriptionError> {
        self.read(
            "getSubscription",
            vec![json!({ "contract": self.contract.to_string(), "id": id.to_string() })],
        )
        .await
    }

    pub async fn is_subscription_active(&self, id: U256) -> Result<bool, SubscriptionError> {
        self.read(
            "isSubscriptionActive",
            vec![json!({ "contract": self.contract.to_string(), "id": id.to_string() })],
        )
        .await
    }

    pub async fn days_remaining(&self, id: U256) -> Result<u64, SubscriptionError> {
        self.read(
            "daysRemaining",
            vec![json!({ "contract": self.contract.to_string(), "id": id.to_string() })],
        )
        .await
    }

    pub async fn get_subscriptions_by_subscriber(
        &self,
        addr: &InternalAddress,
        offset: u64,
        limit: u32,
    ) -> Result<Vec<U256>, SubscriptionError> {
        let limit = limit.min(MAX_PAGE_LIMIT);
        self.read(
            "getSubscriptionsBySubscriber",
            vec![json!({
                "contract": self.contract.to_string(),
                "subscriber": addr.to_string(),
                "offset": offset,
                "limit": limit,
            })],
        )
        .await
    }

    pub async fn get_subscription_count_by_subscriber(
        &self,
        addr: &InternalAddress,
    ) -> Result<u64, SubscriptionError> {
        self.read(
            "getSubscriptionCountBySubscriber",
            vec![json!({ "contract": self.contract.to_string(), "subscriber": addr.to_string() })],
        )
        .await
    }

    pub async fn get_total_subscription_count(&self) -> Result<u64, SubscriptionError> {
        self.read("getTotalSubscriptionCount", vec![self.contract_arg()]).await
    }

    pub async fn get_total_plan_count(&self) -> Result<u64, SubscriptionError> {
        self.read("getTotalPlanCount", vec![self.contract_arg()]).await
    }

    pub async fn get_user_encrypted(&self, sub_id: U256) -> Result<String, SubscriptionError> {
        self.read(
            "getUserEncrypted",
            vec![json!({ "contract": self.contract.to_string(), "subId": sub_id.to_string() })],
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::Sendable;

    fn sendable_with(param: serde_json::Value) -> Sendable {
        Sendable {
            method: "withdraw".to_string(),
            params: vec![param],
        }
    }

    #[test]
    fn check_pull_result_accepts_empty_and_true() {
        assert!(check_pull_result(&sendable_with(serde_json::Value::Null)).is_ok());
        assert!(check_pull_result(&sendable_with(json!(true))).is_ok());
    }

    #[test]
    fn check_pull_result_rejects_false() {
        assert!(matches!(
            check_pull_result(&sendable_with(json!(false))),
            Err(SubscriptionError::PullTokensFailed(_))
        ));
    }

    #[test]
    fn check_pull_result_rejects_malformed_shapes() {
        assert!(matches!(
            check_pull_result(&sendable_with(json!({ "ok": true }))),
            Err(SubscriptionError::PullTokensFailed(_))
        ));
        assert!(matches!(
            check_pull_result(&sendable_with(json!("success"))),
            Err(SubscriptionError::PullTokensFailed(_))
        ));
        assert!(matches!(
            check_pull_result(&sendable_with(json!(1))),
            Err(SubscriptionError::PullTokensFailed(_))
        ));
    }
}
