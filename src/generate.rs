//! Turning caller intent into concrete, signed update proposals.
//!
//! `generate_update` reads (the chain, the store) but never writes; the
//! exchange and persistence of the proposal it produces belong to
//! [`crate::engine`]. The proposer's signature slot is filled here so the
//! proposal can go straight onto the wire.

use thiserror::Error;
use tracing::debug;

use crate::external::{ChainError, ChainReader, DepositRecord, Store, StoreError};
use crate::merkle::MerkleTree;
use crate::sig::Signer;
use crate::state::{
    Balance, ChannelState, CreateParams, DepositParams, ResolveParams, SetupParams, Transfer,
    Update, UpdateDetails, UpdateParams,
};
use crate::types::{Address, Hash, U256};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("invalid params: {0}")]
    InvalidParams(&'static str),
    #[error("channel {channel:?} has no asset {asset:?}")]
    UnknownAsset { channel: Address, asset: Address },
    #[error("transfer {transfer_id:?} is not active")]
    UnknownTransfer { transfer_id: Hash },
    #[error("cannot generate: {0}")]
    CannotGenerate(&'static str),
    #[error("the caller is not a participant of channel {channel:?}")]
    NotAParticipant { channel: Address },
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A generated proposal: the signed update and, for create and resolve, the
/// transfer entering or leaving the active set.
#[derive(Debug, Clone)]
pub struct Generated {
    pub update: Update,
    pub transfer: Option<Transfer>,
}

/// The deposit reconciliation law, shared between generator and validator.
///
/// The alice-side delta is the latest on-chain deposit record, counted once:
/// only when the record's nonce is ahead of the channel's
/// `latest_deposit_nonce`. Bob absorbs whatever of the on-chain holdings is
/// not explained by alice's reconciled share plus locked funds, which is how
/// bob-side deposits (plain transfers to the channel address) enter the
/// channel. Returns the new `[alice, bob]` amounts and the new deposit
/// nonce, or `None` on under-/overflow.
pub(crate) fn reconcile_deposit(
    prev: &ChannelState,
    asset_id: Address,
    record: DepositRecord,
    onchain: U256,
) -> Option<([U256; 2], u64)> {
    let (prev_alice, prev_locked) = match prev.asset_index(asset_id) {
        Some(i) => (prev.balances[i].amount[0], prev.locked_balance[i]),
        None => (U256::zero(), U256::zero()),
    };

    let (alice_delta, deposit_nonce) = if record.nonce > prev.latest_deposit_nonce {
        (record.amount, record.nonce)
    } else {
        (U256::zero(), prev.latest_deposit_nonce)
    };

    let new_alice = prev_alice.checked_add(alice_delta)?;
    let accounted = new_alice.checked_add(prev_locked)?;
    let new_bob = onchain.checked_sub(accounted)?;

    Some(([new_alice, new_bob], deposit_nonce))
}

/// Build a signed update proposal from `params` against `prev`.
///
/// For setup, `prev` is the nonce-0 seed assembled by the engine; for every
/// other type it is the latest persisted state, read under the channel lock.
pub async fn generate_update(
    params: &UpdateParams,
    prev: &ChannelState,
    store: &dyn Store,
    chain: &dyn ChainReader,
    signer: &Signer,
) -> Result<Generated, GenerateError> {
    let our_identifier = signer.public_identifier();
    let our_index =
        prev.participant_index(&our_identifier)
            .ok_or(GenerateError::NotAParticipant {
                channel: prev.channel_address,
            })?;
    let to_identifier = prev
        .counterparty_of(&our_identifier)
        .ok_or(GenerateError::NotAParticipant {
            channel: prev.channel_address,
        })?
        .clone();

    let (asset_id, balance, details, transfer) = match params {
        UpdateParams::Setup(p) => generate_setup(p, prev)?,
        UpdateParams::Deposit(p) => generate_deposit(p, prev, chain).await?,
        UpdateParams::Create(p) => generate_create(p, prev, store).await?,
        UpdateParams::Resolve(p) => generate_resolve(p, prev, store, chain).await?,
    };

    let mut update = Update {
        channel_address: prev.channel_address,
        nonce: prev.nonce + 1,
        from_identifier: our_identifier,
        to_identifier,
        asset_id,
        balance,
        details,
        signatures: [None, None],
    };
    update.signatures[our_index] = Some(signer.sign_eth(update.hash()));

    Ok(Generated { update, transfer })
}

type Pieces = (Address, Balance, UpdateDetails, Option<Transfer>);

fn generate_setup(params: &SetupParams, prev: &ChannelState) -> Result<Pieces, GenerateError> {
    if prev.nonce != 0 {
        return Err(GenerateError::InvalidParams(
            "setup requires a fresh channel",
        ));
    }
    if params.timeout.is_zero() {
        return Err(GenerateError::InvalidParams("zero dispute timeout"));
    }

    let balance = Balance::new(prev.participants, [U256::zero(), U256::zero()]);
    let details = UpdateDetails::Setup {
        counterparty_identifier: params.counterparty_identifier.clone(),
        timeout: params.timeout,
        network_context: params.network_context,
    };
    Ok((Address::ZERO, balance, details, None))
}

async fn generate_deposit(
    params: &DepositParams,
    prev: &ChannelState,
    chain: &dyn ChainReader,
) -> Result<Pieces, GenerateError> {
    let record = chain
        .get_latest_deposit_by_asset_id(prev.channel_address, params.asset_id)
        .await?;
    let onchain = chain
        .get_channel_onchain_balance(prev.channel_address, params.asset_id)
        .await?;

    debug!(
        channel = ?prev.channel_address,
        asset = ?params.asset_id,
        deposit_nonce = record.nonce,
        deposit_amount = %record.amount,
        %onchain,
        "reconciling deposit"
    );

    let (amounts, deposit_nonce) = reconcile_deposit(prev, params.asset_id, record, onchain)
        .ok_or(GenerateError::CannotGenerate(
            "on-chain holdings are below the reconciled alice share plus locked funds",
        ))?;

    let balance = Balance::new(prev.participants, amounts);
    let details = UpdateDetails::Deposit {
        latest_deposit_nonce: deposit_nonce,
    };
    Ok((params.asset_id, balance, details, None))
}

async fn generate_create(
    params: &CreateParams,
    prev: &ChannelState,
    store: &dyn Store,
) -> Result<Pieces, GenerateError> {
    let i = prev
        .asset_index(params.asset_id)
        .ok_or(GenerateError::UnknownAsset {
            channel: prev.channel_address,
            asset: params.asset_id,
        })?;
    if params.balance.total().is_none() {
        return Err(GenerateError::InvalidParams("allocation total overflows"));
    }

    let nonce = prev.nonce + 1;
    let transfer_id = Transfer::derive_id(
        prev.channel_address,
        params.transfer_definition,
        params.transfer_timeout,
        &params.encodings[0],
        &params.initial_state,
        nonce,
    );
    let transfer = Transfer {
        transfer_id,
        channel_address: prev.channel_address,
        chain_id: prev.chain_id(),
        asset_id: params.asset_id,
        initial_balance: params.balance,
        transfer_definition: params.transfer_definition,
        transfer_timeout: params.transfer_timeout,
        initial_state_hash: Transfer::compute_initial_state_hash(&params.initial_state),
        initial_state: params.initial_state.clone(),
        encodings: params.encodings.clone(),
        resolver: None,
        routing_id: params.routing_id,
        meta: params.meta.clone(),
    };

    // Lock the allocation out of the channel balance, slot by slot.
    let mut amounts = prev.balances[i].amount;
    for k in 0..2 {
        amounts[k] = amounts[k]
            .checked_sub(params.balance.amount[k])
            .ok_or(GenerateError::CannotGenerate(
                "allocation exceeds the available channel balance",
            ))?;
    }

    let mut active = store.get_active_transfers(prev.channel_address).await?;
    active.push(transfer.clone());
    let tree = MerkleTree::for_transfers(&active);
    let proof = tree
        .proof(transfer.initial_state_hash)
        .unwrap_or_default();

    let details = UpdateDetails::Create {
        transfer_id,
        balance: params.balance,
        transfer_definition: params.transfer_definition,
        transfer_timeout: params.transfer_timeout,
        transfer_initial_state: params.initial_state.clone(),
        transfer_encodings: params.encodings.clone(),
        merkle_root: tree.root(),
        merkle_proof: proof,
        routing_id: params.routing_id,
        meta: params.meta.clone(),
    };
    Ok((
        params.asset_id,
        Balance::new(prev.participants, amounts),
        details,
        Some(transfer),
    ))
}

async fn generate_resolve(
    params: &ResolveParams,
    prev: &ChannelState,
    store: &dyn Store,
    chain: &dyn ChainReader,
) -> Result<Pieces, GenerateError> {
    let active = store.get_active_transfers(prev.channel_address).await?;
    let transfer = active
        .iter()
        .find(|t| t.transfer_id == params.transfer_id)
        .cloned()
        .ok_or(GenerateError::UnknownTransfer {
            transfer_id: params.transfer_id,
        })?;
    let i = prev
        .asset_index(transfer.asset_id)
        .ok_or(GenerateError::UnknownAsset {
            channel: prev.channel_address,
            asset: transfer.asset_id,
        })?;

    let resolved = chain.resolve(&transfer, &params.resolver).await?;
    let resolved_total = resolved
        .total()
        .ok_or(GenerateError::CannotGenerate("resolver output overflows"))?;
    let locked_total = transfer
        .locked_total()
        .ok_or(GenerateError::CannotGenerate(
            "transfer allocation overflows",
        ))?;
    if resolved_total != locked_total {
        return Err(GenerateError::CannotGenerate(
            "resolver output does not redistribute the locked total",
        ));
    }

    debug!(
        channel = ?prev.channel_address,
        transfer = ?transfer.transfer_id,
        alice_credit = %resolved.amount[0],
        bob_credit = %resolved.amount[1],
        "resolving transfer"
    );

    // Credit the resolver output, slot by slot.
    let mut amounts = prev.balances[i].amount;
    for k in 0..2 {
        amounts[k] = amounts[k]
            .checked_add(resolved.amount[k])
            .ok_or(GenerateError::CannotGenerate("channel balance overflows"))?;
    }

    let remaining: Vec<Transfer> = active
        .iter()
        .filter(|t| t.transfer_id != params.transfer_id)
        .cloned()
        .collect();
    let root = MerkleTree::for_transfers(&remaining).root();

    let details = UpdateDetails::Resolve {
        transfer_id: params.transfer_id,
        transfer_resolver: params.resolver.clone(),
        merkle_root: root,
    };

    let mut resolved_transfer = transfer;
    resolved_transfer.resolver = Some(params.resolver.clone());
    Ok((
        resolved_transfer.asset_id,
        Balance::new(prev.participants, amounts),
        details,
        Some(resolved_transfer),
    ))
}
