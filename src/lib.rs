//! Update engine for two-party off-chain payment channels.
//!
//! Two counterparties share a strictly nonce-ordered channel state holding
//! per-asset balances and conditional transfers locked under a merkle
//! commitment. Either party proposes an update (setup, deposit, create,
//! resolve), the peer validates and countersigns it, and only the fully
//! signed result is persisted. [`engine::UpdateEngine`] drives the
//! exchange; the state transition itself ([`transition::apply_update`]) and
//! its validation are pure and deterministic.
//!
//! Persistence, transport, chain access and locking are injected through
//! the traits in [`external`]; in-memory adapters for all four ship with
//! the crate.

pub mod abi;
pub mod engine;
pub mod external;
pub mod generate;
pub mod merkle;
pub mod messages;
pub mod sig;
pub mod state;
pub mod transition;
pub mod types;
pub mod validate;

pub use engine::{EngineConfig, ProtocolError, RestoreError, UpdateEngine};
pub use state::{
    Balance, ChannelState, CreateParams, DepositParams, NetworkContext, ResolveParams,
    SetupParams, Transfer, Update, UpdateDetails, UpdateParams, UpdateType,
};
pub use types::{Address, Hash, PublicIdentifier, Signature, U256};
