//! Validation of update proposals against the local view of a channel.
//!
//! Every inbound proposal runs through [`validate_update`] before it is
//! countersigned, and a proposer runs its own proposal through the same
//! checks before sending. The checks recompute everything the update claims
//! (balances, merkle roots, deposit reconciliation, resolver output) rather
//! than trusting the peer's arithmetic.

use thiserror::Error;

use crate::external::{ChainError, ChainReader};
use crate::generate::reconcile_deposit;
use crate::merkle::merkle_root;
use crate::sig;
use crate::state::{ChannelState, Transfer, Update, UpdateDetails, UpdateType};
use crate::transition::{apply_update, TransitionError};
use crate::types::{Address, Hash, PublicIdentifier, U256};

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("update targets channel {got:?}, expected {expected:?}")]
    ChannelAddressMismatch { got: Address, expected: Address },
    #[error("stale update: nonce {got} is not ahead of the current nonce {current}")]
    StaleUpdate { got: u64, current: u64 },
    #[error("out-of-sync: received nonce {got}, current nonce {current}")]
    OutOfSync { got: u64, current: u64 },
    #[error("invalid nonce {got}, expected {expected}")]
    InvalidNonce { got: u64, expected: u64 },
    #[error("{identifier} is not a participant of channel {channel:?}")]
    UnknownParticipant {
        channel: Address,
        identifier: PublicIdentifier,
    },
    #[error("missing signature from {signer:?}")]
    MissingSignature { signer: Address },
    #[error("signature recovered {recovered:?}, expected {expected:?}")]
    InvalidSignature {
        recovered: Address,
        expected: Address,
    },
    #[error("signature recovery failed: {0}")]
    Recovery(#[from] sig::Error),
    #[error("merkle root mismatch: computed {computed:?}, update claims {claimed:?}")]
    MerkleRootMismatch { computed: Hash, claimed: Hash },
    #[error("balance mismatch on {context}: expected {expected:?}, update claims {got:?}")]
    BalanceMismatch {
        context: &'static str,
        expected: [U256; 2],
        got: [U256; 2],
    },
    #[error("deposit nonce mismatch: update claims {got}, chain says {expected}")]
    DepositNonceMismatch { got: u64, expected: u64 },
    #[error("conservation violated for asset {asset:?}")]
    Conservation { asset: Address },
    #[error("transfer {transfer_id:?} is not active")]
    UnknownTransfer { transfer_id: Hash },
    #[error("malformed update: {0}")]
    Malformed(&'static str),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Where an inbound nonce falls relative to the local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// Exactly `prev + 1`: applicable.
    Next,
    /// At or below the local nonce: discard.
    Stale,
    /// More than one ahead: the local party has to catch up.
    OutOfSync,
}

pub fn classify_nonce(prev_nonce: u64, update_nonce: u64) -> NonceStatus {
    if update_nonce == prev_nonce + 1 {
        NonceStatus::Next
    } else if update_nonce <= prev_nonce {
        NonceStatus::Stale
    } else {
        NonceStatus::OutOfSync
    }
}

/// Verify the signature slot of the participant at `index` against the
/// canonical update hash.
pub fn verify_participant_signature(
    update: &Update,
    participants: &[Address; 2],
    index: usize,
) -> Result<(), ValidationError> {
    let expected = participants[index];
    let signature = update.signatures[index].ok_or(ValidationError::MissingSignature {
        signer: expected,
    })?;
    let recovered = sig::recover_signer(update.hash(), signature)?;
    if recovered != expected {
        return Err(ValidationError::InvalidSignature {
            recovered,
            expected,
        });
    }
    Ok(())
}

/// Verify both signature slots; used for double-signed updates received via
/// catch-up or restore.
pub fn verify_both_signatures(
    update: &Update,
    participants: &[Address; 2],
) -> Result<(), ValidationError> {
    verify_participant_signature(update, participants, 0)?;
    verify_participant_signature(update, participants, 1)
}

/// A validated proposal: the candidate successor state and, for create and
/// resolve, the affected transfer as reconstructed or looked up locally.
#[derive(Debug, Clone)]
pub struct Validated {
    pub next: ChannelState,
    pub transfer: Option<Transfer>,
}

/// Validate a proposal against the local prior state and active transfer
/// set. Chain-backed checks (deposit reconciliation, resolver evaluation)
/// go through `chain`.
pub async fn validate_update(
    prev: &ChannelState,
    update: &Update,
    active_transfers: &[Transfer],
    chain: &dyn ChainReader,
) -> Result<Validated, ValidationError> {
    if update.channel_address != prev.channel_address {
        return Err(ValidationError::ChannelAddressMismatch {
            got: update.channel_address,
            expected: prev.channel_address,
        });
    }
    match classify_nonce(prev.nonce, update.nonce) {
        NonceStatus::Next => {}
        NonceStatus::Stale => {
            return Err(ValidationError::StaleUpdate {
                got: update.nonce,
                current: prev.nonce,
            })
        }
        NonceStatus::OutOfSync => {
            return Err(ValidationError::OutOfSync {
                got: update.nonce,
                current: prev.nonce,
            })
        }
    }

    let from_index =
        prev.participant_index(&update.from_identifier)
            .ok_or_else(|| ValidationError::UnknownParticipant {
                channel: prev.channel_address,
                identifier: update.from_identifier.clone(),
            })?;
    let to_index =
        prev.participant_index(&update.to_identifier)
            .ok_or_else(|| ValidationError::UnknownParticipant {
                channel: prev.channel_address,
                identifier: update.to_identifier.clone(),
            })?;
    if from_index == to_index {
        return Err(ValidationError::Malformed(
            "update must travel between the two participants",
        ));
    }
    if update.balance.to != prev.participants {
        return Err(ValidationError::Malformed(
            "channel balance slots must be [alice, bob]",
        ));
    }

    verify_participant_signature(update, &prev.participants, from_index)?;

    let transfer = match &update.details {
        UpdateDetails::Setup {
            counterparty_identifier,
            timeout,
            network_context,
        } => {
            if prev.nonce != 0 {
                return Err(ValidationError::InvalidNonce {
                    got: update.nonce,
                    expected: 1,
                });
            }
            if timeout.is_zero() {
                return Err(ValidationError::Malformed("zero dispute timeout"));
            }
            if update.asset_id != Address::ZERO {
                return Err(ValidationError::Malformed(
                    "setup must use the zero asset sentinel",
                ));
            }
            if update.balance.amount != [U256::zero(), U256::zero()] {
                return Err(ValidationError::Malformed("setup balance must be zero"));
            }
            if counterparty_identifier != &update.to_identifier {
                return Err(ValidationError::Malformed(
                    "counterparty identifier must match the receiver",
                ));
            }
            if *network_context != prev.network_context {
                return Err(ValidationError::Malformed("network context mismatch"));
            }
            None
        }
        UpdateDetails::Deposit {
            latest_deposit_nonce,
        } => {
            let record = chain
                .get_latest_deposit_by_asset_id(prev.channel_address, update.asset_id)
                .await?;
            let onchain = chain
                .get_channel_onchain_balance(prev.channel_address, update.asset_id)
                .await?;
            let (amounts, deposit_nonce) = reconcile_deposit(prev, update.asset_id, record, onchain)
                .ok_or(ValidationError::Malformed(
                    "deposit reconciliation under- or overflows",
                ))?;
            if update.balance.amount != amounts {
                return Err(ValidationError::BalanceMismatch {
                    context: "deposit",
                    expected: amounts,
                    got: update.balance.amount,
                });
            }
            if *latest_deposit_nonce != deposit_nonce {
                return Err(ValidationError::DepositNonceMismatch {
                    got: *latest_deposit_nonce,
                    expected: deposit_nonce,
                });
            }
            None
        }
        UpdateDetails::Create {
            merkle_root: claimed,
            ..
        } => {
            let transfer = transfer_from_create(prev, update)?;
            if active_transfers
                .iter()
                .any(|t| t.transfer_id == transfer.transfer_id)
            {
                return Err(ValidationError::Malformed("transfer is already active"));
            }
            let i = prev
                .asset_index(update.asset_id)
                .ok_or(ValidationError::Malformed("create references an unknown asset"))?;

            let mut expected = prev.balances[i].amount;
            for k in 0..2 {
                expected[k] = expected[k]
                    .checked_sub(transfer.initial_balance.amount[k])
                    .ok_or(ValidationError::BalanceMismatch {
                        context: "create debit",
                        expected: prev.balances[i].amount,
                        got: transfer.initial_balance.amount,
                    })?;
            }
            if update.balance.amount != expected {
                return Err(ValidationError::BalanceMismatch {
                    context: "create",
                    expected,
                    got: update.balance.amount,
                });
            }

            let mut with_new = active_transfers.to_vec();
            with_new.push(transfer.clone());
            let computed = merkle_root(&with_new);
            if computed != *claimed {
                return Err(ValidationError::MerkleRootMismatch {
                    computed,
                    claimed: *claimed,
                });
            }
            Some(transfer)
        }
        UpdateDetails::Resolve {
            transfer_id,
            transfer_resolver,
            merkle_root: claimed,
        } => {
            let transfer = active_transfers
                .iter()
                .find(|t| t.transfer_id == *transfer_id)
                .cloned()
                .ok_or(ValidationError::UnknownTransfer {
                    transfer_id: *transfer_id,
                })?;
            if transfer.asset_id != update.asset_id {
                return Err(ValidationError::Malformed(
                    "resolve asset does not match the transfer",
                ));
            }
            let i = prev
                .asset_index(update.asset_id)
                .ok_or(ValidationError::Malformed("resolve references an unknown asset"))?;

            let resolved = chain.resolve(&transfer, transfer_resolver).await?;
            let resolved_total = resolved
                .total()
                .ok_or(ValidationError::Malformed("resolver output overflows"))?;
            let locked_total = transfer
                .locked_total()
                .ok_or(ValidationError::Malformed("transfer allocation overflows"))?;
            if resolved_total != locked_total {
                return Err(ValidationError::Conservation {
                    asset: update.asset_id,
                });
            }

            let mut expected = prev.balances[i].amount;
            for k in 0..2 {
                expected[k] = expected[k].checked_add(resolved.amount[k]).ok_or(
                    ValidationError::BalanceMismatch {
                        context: "resolve credit",
                        expected: prev.balances[i].amount,
                        got: resolved.amount,
                    },
                )?;
            }
            if update.balance.amount != expected {
                return Err(ValidationError::BalanceMismatch {
                    context: "resolve",
                    expected,
                    got: update.balance.amount,
                });
            }

            let remaining: Vec<Transfer> = active_transfers
                .iter()
                .filter(|t| t.transfer_id != *transfer_id)
                .cloned()
                .collect();
            let computed = merkle_root(&remaining);
            if computed != *claimed {
                return Err(ValidationError::MerkleRootMismatch {
                    computed,
                    claimed: *claimed,
                });
            }

            let mut resolved_transfer = transfer;
            resolved_transfer.resolver = Some(transfer_resolver.clone());
            Some(resolved_transfer)
        }
    };

    let next = apply_update(prev, update, transfer.as_ref())?;

    // Totals of untouched assets never move; a deposit pins its target asset
    // through the chain-backed reconciliation above instead.
    for i in 0..prev.asset_ids.len() {
        if update.update_type() == UpdateType::Deposit && prev.asset_ids[i] == update.asset_id {
            continue;
        }
        if prev.asset_total(i) != next.asset_total(i) {
            return Err(ValidationError::Conservation {
                asset: prev.asset_ids[i],
            });
        }
    }

    Ok(Validated { next, transfer })
}

/// Rebuild the transfer a create update describes and cross-check the
/// claimed id against its derivation.
pub(crate) fn transfer_from_create(
    prev: &ChannelState,
    update: &Update,
) -> Result<Transfer, ValidationError> {
    let UpdateDetails::Create {
        transfer_id,
        balance,
        transfer_definition,
        transfer_timeout,
        transfer_initial_state,
        transfer_encodings,
        routing_id,
        meta,
        ..
    } = &update.details
    else {
        return Err(ValidationError::Malformed("expected create details"));
    };

    let derived = Transfer::derive_id(
        update.channel_address,
        *transfer_definition,
        *transfer_timeout,
        &transfer_encodings[0],
        transfer_initial_state,
        update.nonce,
    );
    if derived != *transfer_id {
        return Err(ValidationError::Malformed(
            "transfer id does not match its derivation",
        ));
    }

    Ok(Transfer {
        transfer_id: derived,
        channel_address: update.channel_address,
        chain_id: prev.chain_id(),
        asset_id: update.asset_id,
        initial_balance: *balance,
        transfer_definition: *transfer_definition,
        transfer_timeout: *transfer_timeout,
        initial_state_hash: Transfer::compute_initial_state_hash(transfer_initial_state),
        initial_state: transfer_initial_state.clone(),
        encodings: transfer_encodings.clone(),
        resolver: None,
        routing_id: *routing_id,
        meta: meta.clone(),
    })
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use crate::external::MockChainReader;
    use crate::sig::Signer;
    use crate::state::{Balance, NetworkContext};

    use super::*;

    struct Party {
        signer: Signer,
    }

    fn parties() -> (Party, Party) {
        let mut rng = StdRng::seed_from_u64(7);
        let a = Signer::new(&mut rng);
        let b = Signer::new(&mut rng);
        // Alice is participants[0] by construction.
        (Party { signer: a }, Party { signer: b })
    }

    fn network() -> NetworkContext {
        NetworkContext {
            chain_id: 1337,
            channel_factory_address: Address([0xfa; 20]),
            transfer_registry_address: Address([0xfb; 20]),
        }
    }

    fn channel_with_asset(alice: &Party, bob: &Party, asset: Address) -> ChannelState {
        let mut state = ChannelState::setup_seed(
            Address([0xcc; 20]),
            network(),
            [alice.signer.address(), bob.signer.address()],
            [
                alice.signer.public_identifier(),
                bob.signer.public_identifier(),
            ],
        );
        state.nonce = 3;
        state.timeout = U256::from(800u64);
        state.asset_ids = vec![asset];
        state.balances = vec![Balance::new(
            [alice.signer.address(), bob.signer.address()],
            [U256::from(43u64), U256::from(22u64)],
        )];
        state.locked_balance = vec![U256::zero()];
        state
    }

    fn create_update(state: &ChannelState, from: &Party, asset: Address) -> (Update, Transfer) {
        let initial_state = vec![0xaa, 0xbb];
        let transfer_definition = Address([0xdd; 20]);
        let transfer_timeout = U256::from(700u64);
        let encodings: [String; 2] = ["tuple(bytes32 lock)".into(), "tuple(bytes32 pre)".into()];
        let nonce = state.nonce + 1;
        let transfer_id = Transfer::derive_id(
            state.channel_address,
            transfer_definition,
            transfer_timeout,
            &encodings[0],
            &initial_state,
            nonce,
        );
        let initial_balance = Balance::new(
            state.participants,
            [U256::zero(), U256::from(14u64)],
        );
        let transfer = Transfer {
            transfer_id,
            channel_address: state.channel_address,
            chain_id: state.chain_id(),
            asset_id: asset,
            initial_balance,
            transfer_definition,
            transfer_timeout,
            initial_state_hash: Transfer::compute_initial_state_hash(&initial_state),
            initial_state: initial_state.clone(),
            encodings: encodings.clone(),
            resolver: None,
            routing_id: None,
            meta: None,
        };
        let root = merkle_root(std::slice::from_ref(&transfer));

        let from_id = from.signer.public_identifier();
        let to_id = state.counterparty_of(&from_id).unwrap().clone();
        let mut update = Update {
            channel_address: state.channel_address,
            nonce,
            from_identifier: from_id.clone(),
            to_identifier: to_id,
            asset_id: asset,
            balance: Balance::new(
                state.participants,
                [U256::from(43u64), U256::from(8u64)],
            ),
            details: UpdateDetails::Create {
                transfer_id,
                balance: initial_balance,
                transfer_definition,
                transfer_timeout,
                transfer_initial_state: initial_state,
                transfer_encodings: encodings,
                merkle_root: root,
                merkle_proof: Vec::new(),
                routing_id: None,
                meta: None,
            },
            signatures: [None, None],
        };
        let index = state.participant_index(&from_id).unwrap();
        update.signatures[index] = Some(from.signer.sign_eth(update.hash()));
        (update, transfer)
    }

    #[tokio::test]
    async fn valid_create_passes() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let (update, transfer) = create_update(&state, &bob, asset);
        let validated = validate_update(&state, &update, &[], &chain).await.unwrap();

        assert_eq!(validated.next.nonce, state.nonce + 1);
        assert_eq!(validated.next.locked_balance, vec![U256::from(14u64)]);
        assert_eq!(
            validated.transfer.as_ref().unwrap().transfer_id,
            transfer.transfer_id
        );
    }

    #[tokio::test]
    async fn stale_nonce_is_rejected() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let (mut update, _) = create_update(&state, &bob, asset);
        update.nonce = state.nonce;

        assert!(matches!(
            validate_update(&state, &update, &[], &chain).await,
            Err(ValidationError::StaleUpdate { .. })
        ));
    }

    #[tokio::test]
    async fn future_nonce_is_out_of_sync() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let (mut update, _) = create_update(&state, &bob, asset);
        update.nonce = state.nonce + 3;

        assert!(matches!(
            validate_update(&state, &update, &[], &chain).await,
            Err(ValidationError::OutOfSync { .. })
        ));
    }

    #[tokio::test]
    async fn unsigned_update_is_rejected() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let (mut update, _) = create_update(&state, &bob, asset);
        update.signatures = [None, None];

        assert!(matches!(
            validate_update(&state, &update, &[], &chain).await,
            Err(ValidationError::MissingSignature { .. })
        ));
    }

    #[tokio::test]
    async fn tampered_update_fails_signature_check() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let (mut update, _) = create_update(&state, &bob, asset);
        // Shift one unit from alice to bob after signing.
        update.balance.amount = [U256::from(42u64), U256::from(9u64)];

        // The claimed balance no longer matches the signed hash; the
        // signature check must catch it one way or another.
        let err = validate_update(&state, &update, &[], &chain)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidSignature { .. }
                | ValidationError::Recovery(_)
                | ValidationError::BalanceMismatch { .. }
        ));
    }

    #[tokio::test]
    async fn wrong_merkle_root_is_rejected() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let (mut update, _) = create_update(&state, &bob, asset);
        if let UpdateDetails::Create { merkle_root, .. } = &mut update.details {
            *merkle_root = Hash([0x99; 32]);
        }
        let index = state
            .participant_index(&bob.signer.public_identifier())
            .unwrap();
        update.signatures = [None, None];
        update.signatures[index] = Some(bob.signer.sign_eth(update.hash()));

        assert!(matches!(
            validate_update(&state, &update, &[], &chain).await,
            Err(ValidationError::MerkleRootMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn replay_after_apply_is_stale() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let (update, _) = create_update(&state, &bob, asset);
        let validated = validate_update(&state, &update, &[], &chain).await.unwrap();

        // Same update against the resulting state is a stale replay.
        let active = vec![validated.transfer.unwrap()];
        assert!(matches!(
            validate_update(&validated.next, &update, &active, &chain).await,
            Err(ValidationError::StaleUpdate { .. })
        ));
    }

    #[tokio::test]
    async fn foreign_signer_is_rejected() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let state = channel_with_asset(&alice, &bob, asset);
        let chain = MockChainReader::new();

        let mut rng = StdRng::seed_from_u64(99);
        let mallory = Signer::new(&mut rng);

        let (mut update, _) = create_update(&state, &bob, asset);
        let index = state
            .participant_index(&bob.signer.public_identifier())
            .unwrap();
        update.signatures[index] = Some(mallory.sign_eth(update.hash()));

        assert!(matches!(
            validate_update(&state, &update, &[], &chain).await,
            Err(ValidationError::InvalidSignature { .. })
        ));
    }

    #[tokio::test]
    async fn deposit_must_match_chain_readings() {
        let (alice, bob) = parties();
        let asset = Address([0xee; 20]);
        let mut state = channel_with_asset(&alice, &bob, asset);
        state.balances[0].amount = [U256::zero(), U256::zero()];
        let chain = MockChainReader::new();
        chain.set_onchain_balance(state.channel_address, asset, U256::from(17u64));

        let from_id = bob.signer.public_identifier();
        let to_id = state.counterparty_of(&from_id).unwrap().clone();
        let mut update = Update {
            channel_address: state.channel_address,
            nonce: state.nonce + 1,
            from_identifier: from_id.clone(),
            to_identifier: to_id,
            asset_id: asset,
            // Claims more for bob than the chain holds.
            balance: Balance::new(state.participants, [U256::zero(), U256::from(99u64)]),
            details: UpdateDetails::Deposit {
                latest_deposit_nonce: 0,
            },
            signatures: [None, None],
        };
        let index = state.participant_index(&from_id).unwrap();
        update.signatures[index] = Some(bob.signer.sign_eth(update.hash()));

        assert!(matches!(
            validate_update(&state, &update, &[], &chain).await,
            Err(ValidationError::BalanceMismatch { .. })
        ));
    }
}
