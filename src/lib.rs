//! Treasury and swap core for an on-chain subscription-billing system.
//!
//! This crate implements the hardest part of a self-hosted, on-chain
//! subscription service that transacts over a Bitcoin-layer smart-contract
//! platform: periodically sweeping subscription revenue out of the
//! subscription contract, keeping operational wallets funded, and routing
//! swaps between the chain's native coin and fungible tokens.
//!
//! # Modules
//!
//! - [`address`] — bech32m <-> internal address codec and the post-quantum
//!   resolver indirection.
//! - [`wallet`] — keyfile-backed wallet derivation (classical + post-quantum
//!   keypair), zeroized on drop.
//! - [`addressbook`] — role -> address/keyfile registry, persisted as JSON
//!   by an external writer.
//! - [`amount`] — base-unit integer amounts: decimal string parsing/formatting
//!   and basis-point distribution arithmetic.
//! - [`rpc`] — JSON-RPC transport to the chain and the simulate-then-send
//!   result shape shared by every on-chain write.
//! - [`token`] — uniform fungible-token adapter (balance, allowance, transfer).
//! - [`subscription`] — typed client over the subscription contract's
//!   operations and reads.
//! - [`swap`] — the swap router: native-buy (two-phase), native-sell
//!   (list-and-poll), and AMM (single-call) routes.
//! - [`fund`] — the fund manager's five-step withdrawal/refill/distribution
//!   pipeline and the lighter gas check.
//! - [`scheduler`] — the tick-driven loop that fires fund cycles and gas
//!   checks with singleton guards, and observes shutdown signals.
//! - [`config`] — `blockhost.yaml` / `web3-defaults.yaml` / `revenue-share.json`
//!   loading.
//! - [`persist`] — atomic tmpfile+rename file writes shared by fund-state
//!   and addressbook persistence.
//! - [`logging`] — `tracing` setup.

pub mod address;
pub mod addressbook;
pub mod amount;
pub mod config;
pub mod fund;
pub mod logging;
pub mod persist;
pub mod rpc;
pub mod scheduler;
pub mod sig_down;
pub mod subscription;
pub mod swap;
pub mod token;
pub mod wallet;
