//! Payloads exchanged between the two peers.
//!
//! Encoding and transport are the messaging service's concern; the engine
//! only ever sees these typed values. Each request/reply pair maps to one
//! protocol subject: update exchange, restore, restore confirmation.

use serde::{Deserialize, Serialize};

use crate::state::{ChannelState, Transfer, Update};
use crate::types::{Address, Hash};

/// A signed proposal sent to the counterparty for countersigning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpdateRequest {
    /// The proposed update, carrying the proposer's signature.
    pub update: Update,
    /// The proposer's latest applied, double-signed update. Lets a responder
    /// that is exactly one nonce behind catch up without a restore.
    pub previous: Option<Update>,
}

/// Why a responder refused to countersign.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Proposed nonce is not ahead of the responder's state; the proposer is
    /// the one who has to catch up.
    Stale,
    /// Proposed nonce is too far ahead; the responder will restore.
    OutOfSync,
    /// Both sides proposed at the same nonce and the responder wins the
    /// tie-break.
    ConcurrentUpdate,
    /// The update failed validation.
    Validation,
    /// The responder could not serialize access to the channel in time.
    Busy,
    /// Responder-side failure unrelated to the update itself.
    Internal,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum UpdateReply {
    /// Countersigned; `update` carries both signatures.
    Accepted { update: Box<Update> },
    Rejected {
        reason: RejectReason,
        /// The responder's current channel nonce, so the proposer can decide
        /// whether to retry or restore.
        channel_nonce: u64,
        message: String,
    },
}

/// Ask the counterparty for its authoritative copy of the shared channel on
/// the given chain.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct RestoreRequest {
    pub chain_id: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RestoreReply {
    pub channel: ChannelState,
    pub active_transfers: Vec<Transfer>,
}

/// Sent after the restored state is persisted; releases the serving peer's
/// channel lock.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RestoreConfirm {
    pub channel_address: Address,
    pub active_transfer_ids: Vec<Hash>,
}
