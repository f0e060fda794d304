//! The pure state-transition function.
//!
//! `apply_update` computes the successor of a channel state under a single
//! update. No I/O, no clock, no randomness: both parties run it on the same
//! inputs and must arrive at byte-identical states. All authorization and
//! cross-checking (signatures, merkle roots, chain readings) happens in
//! [`crate::validate`] before this function is trusted with an inbound
//! update.

use thiserror::Error;

use crate::state::{ChannelState, Transfer, Update, UpdateDetails, UpdateType};
use crate::types::{Address, Hash, U256};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("channel {channel:?}: setup requires a fresh channel, found nonce {nonce}")]
    SetupOnExistingChannel { channel: Address, nonce: u64 },
    #[error("channel {channel:?}: {update_type:?} update requires the affected transfer")]
    MissingTransfer {
        channel: Address,
        update_type: UpdateType,
    },
    #[error("channel {channel:?} nonce {nonce}: no such asset {asset:?}")]
    UnknownAsset {
        channel: Address,
        nonce: u64,
        asset: Address,
    },
    #[error("channel {channel:?} nonce {nonce}: arithmetic overflow or underflow on {field}")]
    Arithmetic {
        channel: Address,
        nonce: u64,
        field: &'static str,
    },
}

/// Apply `update` to `prev`, producing the successor state.
///
/// `transfer` is required iff the update is a create or resolve; it carries
/// the allocation whose total moves in or out of `locked_balance`.
pub fn apply_update(
    prev: &ChannelState,
    update: &Update,
    transfer: Option<&Transfer>,
) -> Result<ChannelState, TransitionError> {
    let mut next = ChannelState {
        channel_address: prev.channel_address,
        network_context: prev.network_context,
        participants: prev.participants,
        public_identifiers: prev.public_identifiers.clone(),
        nonce: prev.nonce + 1,
        timeout: prev.timeout,
        balances: prev.balances.clone(),
        asset_ids: prev.asset_ids.clone(),
        locked_balance: prev.locked_balance.clone(),
        merkle_root: prev.merkle_root,
        latest_deposit_nonce: prev.latest_deposit_nonce,
        latest_update: Some(update.clone()),
    };

    match &update.details {
        UpdateDetails::Setup { timeout, .. } => {
            if prev.nonce != 0 {
                return Err(TransitionError::SetupOnExistingChannel {
                    channel: prev.channel_address,
                    nonce: prev.nonce,
                });
            }
            next.timeout = *timeout;
            next.balances = Vec::new();
            next.asset_ids = Vec::new();
            next.locked_balance = Vec::new();
            next.latest_deposit_nonce = 0;
            next.merkle_root = Hash::ZERO;
        }
        UpdateDetails::Deposit {
            latest_deposit_nonce,
        } => {
            match prev.asset_index(update.asset_id) {
                Some(i) => next.balances[i] = update.balance,
                None => {
                    next.asset_ids.push(update.asset_id);
                    next.balances.push(update.balance);
                    next.locked_balance.push(U256::zero());
                }
            }
            next.latest_deposit_nonce = *latest_deposit_nonce;
        }
        UpdateDetails::Create { merkle_root, .. } => {
            let transfer = transfer.ok_or(TransitionError::MissingTransfer {
                channel: prev.channel_address,
                update_type: UpdateType::Create,
            })?;
            let i = asset_index(prev, update)?;
            let amount = locked_total(prev, update, transfer)?;
            next.locked_balance[i] = next.locked_balance[i].checked_add(amount).ok_or(
                TransitionError::Arithmetic {
                    channel: prev.channel_address,
                    nonce: update.nonce,
                    field: "locked_balance",
                },
            )?;
            next.balances[i] = update.balance;
            next.merkle_root = *merkle_root;
        }
        UpdateDetails::Resolve { merkle_root, .. } => {
            let transfer = transfer.ok_or(TransitionError::MissingTransfer {
                channel: prev.channel_address,
                update_type: UpdateType::Resolve,
            })?;
            let i = asset_index(prev, update)?;
            let amount = locked_total(prev, update, transfer)?;
            next.locked_balance[i] = next.locked_balance[i].checked_sub(amount).ok_or(
                TransitionError::Arithmetic {
                    channel: prev.channel_address,
                    nonce: update.nonce,
                    field: "locked_balance",
                },
            )?;
            next.balances[i] = update.balance;
            next.merkle_root = *merkle_root;
        }
    }

    Ok(next)
}

fn asset_index(prev: &ChannelState, update: &Update) -> Result<usize, TransitionError> {
    prev.asset_index(update.asset_id)
        .ok_or(TransitionError::UnknownAsset {
            channel: prev.channel_address,
            nonce: update.nonce,
            asset: update.asset_id,
        })
}

/// The full locked sum of a transfer's initial allocation, regardless of
/// whether the allocation's `to` addresses match the channel participants.
fn locked_total(
    prev: &ChannelState,
    update: &Update,
    transfer: &Transfer,
) -> Result<U256, TransitionError> {
    transfer
        .locked_total()
        .ok_or(TransitionError::Arithmetic {
            channel: prev.channel_address,
            nonce: update.nonce,
            field: "transfer.initial_balance",
        })
}
