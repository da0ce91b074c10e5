//! JSON-RPC transport to the chain, and the simulate-then-send result shape
//! shared by every on-chain write in this crate.
//!
//! Every typed call the chain exposes resolves to either `{"properties": ...}`
//! or `{"error": "..."}`. [`RpcOutcome`] models that tagged shape explicitly;
//! callers must discriminate it before extracting `properties` rather than
//! relying on truthiness (see `DESIGN.md`).

use alloy_primitives::U256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::address::InternalAddress;

/// Errors talking to the chain's JSON-RPC endpoint.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),
    #[error("malformed RPC response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("RPC method returned an error: {0}")]
    MethodError(String),
}

/// The tagged result of a `simulate`-style call: either the chain accepted
/// the call and returns structured properties, or it rejected it with a
/// one-line error string. Never inferred from truthiness.
#[derive(Debug, Clone)]
pub enum RpcOutcome<T> {
    Properties(T),
    Error(String),
}

impl<T: DeserializeOwned> RpcOutcome<T> {
    fn from_value(value: Value) -> Result<Self, RpcError> {
        if let Some(err) = value.get("error") {
            let message = err.as_str().map(str::to_string).unwrap_or_else(|| err.to_string());
            return Ok(RpcOutcome::Error(message));
        }
        let properties = value
            .get("properties")
            .cloned()
            .unwrap_or(value);
        Ok(RpcOutcome::Properties(serde_json::from_value(properties)?))
    }

    /// Rejects the `{error}` shape, surfacing it through `on_error`, and
    /// returns the extracted properties otherwise. This is the single
    /// discrimination point every adapter method should route through.
    pub fn into_result<E>(self, on_error: impl FnOnce(String) -> E) -> Result<T, E> {
        match self {
            RpcOutcome::Properties(t) => Ok(t),
            RpcOutcome::Error(e) => Err(on_error(e)),
        }
    }
}

/// A handle returned by a successful simulation, ready to be signed and sent.
/// Carries whatever calldata/metadata the concrete call needs; this crate
/// treats it opaquely and passes it straight to [`ChainProvider::send_signed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sendable {
    pub method: String,
    pub params: Vec<Value>,
}

/// Chain-reported recommended fee parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GasParameters {
    pub fee_rate: u64,
}

/// A minimal description of an unspent output, used for native-coin transfers.
#[derive(Debug, Clone, Deserialize)]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub value_sats: u64,
}

/// Default spend cap passed to every signed submission unless the caller
/// overrides it.
pub const DEFAULT_MAX_SAT_TO_SPEND: u64 = 100_000;

/// Everything needed to sign and submit a [`Sendable`] call.
#[derive(Debug, Clone)]
pub struct SendSigned<'a> {
    pub sendable: &'a Sendable,
    pub signer: &'a str,
    pub mldsa_signer: &'a str,
    pub refund_to: InternalAddress,
    pub max_sat_to_spend: u64,
    pub network: &'a str,
}

/// The chain's JSON-RPC surface, consumed by every higher-level adapter in
/// this crate. A single object owned by the process and closed exactly once
/// on shutdown.
#[derive(Debug, Clone)]
pub struct ChainProvider {
    client: reqwest::Client,
    url: String,
}

impl ChainProvider {
    /// Connects to the chain's JSON-RPC endpoint at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn call_raw(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let response: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .json()
            .await?;
        response
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::MethodError("missing result field".to_string()))
    }

    /// Simulates a call off-chain; yields either a [`Sendable`] or a
    /// structured chain-side error. Never signs or submits anything.
    pub async fn simulate(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<RpcOutcome<Sendable>, RpcError> {
        let result = self
            .call_raw("simulate", json!({ "method": method, "params": params }))
            .await?;
        RpcOutcome::from_value(result)
    }

    /// Signs and submits a previously simulated call.
    pub async fn send_signed(&self, request: SendSigned<'_>) -> Result<String, RpcError> {
        let result = self
            .call_raw(
                "sendSignedTransaction",
                json!({
                    "method": request.sendable.method,
                    "params": request.sendable.params,
                    "signer": request.signer,
                    "mldsaSigner": request.mldsa_signer,
                    "refundTo": request.refund_to.to_string(),
                    "maxSatToSpend": request.max_sat_to_spend,
                    "network": request.network,
                }),
            )
            .await?;
        let outcome: RpcOutcome<TxHash> = RpcOutcome::from_value(result)?;
        outcome
            .into_result(RpcError::MethodError)
            .map(|t| t.tx_hash)
    }

    /// Reads a single storage slot/value from the chain.
    pub async fn read_storage(&self, key: &str) -> Result<Value, RpcError> {
        self.call_raw("readStorage", json!({ "key": key })).await
    }

    /// Reads the native-coin balance of `address`, in sats.
    pub async fn get_balance(&self, address: &InternalAddress) -> Result<U256, RpcError> {
        let value = self
            .call_raw("getBalance", json!({ "address": address.to_string() }))
            .await?;
        Ok(serde_json::from_value::<BalanceResult>(value)?.balance)
    }

    /// Current chain height.
    pub async fn get_block_number(&self) -> Result<u64, RpcError> {
        let value = self.call_raw("getBlockNumber", json!({})).await?;
        Ok(serde_json::from_value::<BlockNumberResult>(value)?.height)
    }

    /// UTXOs owned by `address`, for plain native-coin value transfers.
    pub async fn get_utxos(&self, address: &InternalAddress) -> Result<Vec<Utxo>, RpcError> {
        let value = self
            .call_raw("getUtxos", json!({ "address": address.to_string() }))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Looks up the on-chain identity behind a post-quantum witness program.
    /// Part of [`crate::address::PublicKeyIndex`]'s production wiring.
    pub async fn get_public_key_info(&self, program: &[u8; 32]) -> Result<[u8; 32], RpcError> {
        let value = self
            .call_raw(
                "getPublicKeyInfo",
                json!({ "program": format!("0x{}", hex_lower(program)) }),
            )
            .await?;
        let result: PublicKeyInfoResult = serde_json::from_value(value)?;
        let bytes = hex::decode(result.identity.trim_start_matches("0x"))
            .map_err(|e| RpcError::MethodError(e.to_string()))?;
        let mut out = [0u8; 32];
        if bytes.len() != 32 {
            return Err(RpcError::MethodError("identity is not 32 bytes".to_string()));
        }
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Chain-recommended fee parameters.
    pub async fn get_gas_parameters(&self) -> Result<GasParameters, RpcError> {
        let value = self.call_raw("getGasParameters", json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Closes the provider. The process owns exactly one [`ChainProvider`]
    /// and closes it once on shutdown; underlying HTTP connections are torn
    /// down on drop, this is a documented no-op kept for symmetry with the
    /// scheduler's shutdown sequencing.
    pub fn close(self) {
        drop(self);
    }
}

/// An in-memory [`Chain`] double for exercising RPC-dependent adapters
/// without a live endpoint. Scripted per test: block heights are consumed
/// in order from a fixed queue (the last value repeats once exhausted),
/// and `simulate` responses are looked up by method name.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MockChain {
        pub blocks: Mutex<Vec<u64>>,
        pub simulate: Mutex<HashMap<String, RpcOutcome<Sendable>>>,
        pub balances: Mutex<HashMap<String, U256>>,
    }

    impl MockChain {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_blocks(blocks: Vec<u64>) -> Self {
            Self {
                blocks: Mutex::new(blocks),
                ..Self::default()
            }
        }

        pub(crate) fn stub_simulate(&self, method: &str, outcome: RpcOutcome<Sendable>) {
            self.simulate.lock().unwrap().insert(method.to_string(), outcome);
        }

        pub(crate) fn stub_balance(&self, address: &InternalAddress, balance: U256) {
            self.balances.lock().unwrap().insert(address.to_string(), balance);
        }

        fn sendable(method: &str, properties: Value) -> RpcOutcome<Sendable> {
            RpcOutcome::Properties(Sendable {
                method: method.to_string(),
                params: vec![properties],
            })
        }

        pub(crate) fn stub_simulate_properties(&self, method: &str, properties: Value) {
            self.stub_simulate(method, Self::sendable(method, properties));
        }
    }

    #[async_trait::async_trait]
    impl Chain for MockChain {
        async fn simulate(&self, method: &str, _params: Vec<Value>) -> Result<RpcOutcome<Sendable>, RpcError> {
            Ok(self
                .simulate
                .lock()
                .unwrap()
                .get(method)
                .cloned()
                .unwrap_or_else(|| RpcOutcome::Error(format!("no stub for {method}"))))
        }

        async fn send_signed(&self, _request: SendSigned<'_>) -> Result<String, RpcError> {
            Ok("0xmocktxhash".to_string())
        }

        async fn read_storage(&self, _key: &str) -> Result<Value, RpcError> {
            Ok(Value::Null)
        }

        async fn get_balance(&self, address: &InternalAddress) -> Result<U256, RpcError> {
            Ok(self
                .balances
                .lock()
                .unwrap()
                .get(&address.to_string())
                .copied()
                .unwrap_or(U256::ZERO))
        }

        async fn get_block_number(&self) -> Result<u64, RpcError> {
            let mut blocks = self.blocks.lock().unwrap();
            if blocks.is_empty() {
                return Ok(0);
            }
            if blocks.len() == 1 {
                return Ok(blocks[0]);
            }
            Ok(blocks.remove(0))
        }

        async fn get_utxos(&self, _address: &InternalAddress) -> Result<Vec<Utxo>, RpcError> {
            Ok(Vec::new())
        }

        async fn get_gas_parameters(&self) -> Result<GasParameters, RpcError> {
            Ok(GasParameters { fee_rate: 1 })
        }
    }
}

fn hex_lower(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Deserialize)]
struct TxHash {
    #[serde(rename = "txHash")]
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResult {
    balance: U256,
}

#[derive(Debug, Deserialize)]
struct BlockNumberResult {
    height: u64,
}

#[derive(Debug, Deserialize)]
struct PublicKeyInfoResult {
    identity: String,
}

/// A mockable view over [`ChainProvider`]'s surface, used by higher-level
/// adapters so unit tests can substitute an in-memory fake instead of
/// speaking real JSON-RPC.
#[async_trait::async_trait]
pub trait Chain: Send + Sync {
    async fn simulate(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<RpcOutcome<Sendable>, RpcError>;
    async fn send_signed(&self, request: SendSigned<'_>) -> Result<String, RpcError>;
    async fn read_storage(&self, key: &str) -> Result<Value, RpcError>;
    async fn get_balance(&self, address: &InternalAddress) -> Result<U256, RpcError>;
    async fn get_block_number(&self) -> Result<u64, RpcError>;
    async fn get_utxos(&self, address: &InternalAddress) -> Result<Vec<Utxo>, RpcError>;
    async fn get_gas_parameters(&self) -> Result<GasParameters, RpcError>;
}

#[async_trait::async_trait]
impl Chain for ChainProvider {
    async fn simulate(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<RpcOutcome<Sendable>, RpcError> {
        ChainProvider::simulate(self, method, params).await
    }
    async fn send_signed(&self, request: SendSigned<'_>) -> Result<String, RpcError> {
        ChainProvider::send_signed(self, request).await
    }
    async fn read_storage(&self, key: &str) -> Result<Value, RpcError> {
        ChainProvider::read_storage(self, key).await
    }
    async fn get_balance(&self, address: &InternalAddress) -> Result<U256, RpcError> {
        ChainProvider::get_balance(self, address).await
    }
    async fn get_block_number(&self) -> Result<u64, RpcError> {
        ChainProvider::get_block_number(self).await
    }
    async fn get_utxos(&self, address: &InternalAddress) -> Result<Vec<Utxo>, RpcError> {
        ChainProvider::get_utxos(self, address).await
    }
    async fn get_gas_parameters(&self) -> Result<GasParameters, RpcError> {
        ChainProvider::get_gas_parameters(self).await
    }
}
