//! The two-party synchronization protocol.
//!
//! `UpdateEngine` drives the propose → countersign → persist exchange for
//! one party. All state-changing work on a channel runs under that party's
//! channel lock; operations on different channels proceed in parallel. A
//! proposal holds the lock across the whole round-trip, and nothing is
//! persisted until both signatures are present and verified, so a timeout
//! or crash mid-exchange never leaves partial state behind.
//!
//! Concurrent proposals at the same nonce resolve deterministically: the
//! party with the lexicographically smaller public identifier wins, the
//! loser surfaces a retryable error after countersigning the winner's
//! update. A peer that proves to be more than one nonce behind restores the
//! full channel from its counterparty instead of replaying updates.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::external::{
    ChainError, ChainReader, LockError, LockService, LockValue, Messaging, MessagingError, Store,
    StoreError,
};
use crate::generate::{generate_update, GenerateError};
use crate::merkle::merkle_root;
use crate::messages::{
    RejectReason, RestoreConfirm, RestoreReply, RestoreRequest, UpdateReply, UpdateRequest,
};
use crate::sig::Signer;
use crate::state::{ChannelState, Transfer, Update, UpdateDetails, UpdateParams, UpdateType};
use crate::transition::apply_update;
use crate::types::{Address, PublicIdentifier};
use crate::validate::{self, classify_nonce, NonceStatus, ValidationError};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to acquire the lock on channel {channel:?}")]
    AcquireLockFailed {
        channel: Address,
        #[source]
        source: LockError,
    },
    #[error("counterparty did not answer within {0:?}")]
    MessagingTimeout(Duration),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    #[error("counterparty rejected the update ({reason:?}, its nonce {channel_nonce}): {message}")]
    Rejected {
        reason: RejectReason,
        channel_nonce: u64,
        message: String,
    },
    #[error("concurrent proposal lost to {winner}; retry against the new state")]
    ConcurrentUpdate { winner: PublicIdentifier },
    #[error(transparent)]
    Generate(#[from] GenerateError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("channel {0:?} not found")]
    ChannelNotFound(Address),
    #[error("channel {0:?} already exists")]
    ChannelExists(Address),
    #[error("no channel with {counterparty} on chain {chain_id}")]
    NoChannelWith {
        counterparty: PublicIdentifier,
        chain_id: u64,
    },
    #[error(transparent)]
    Restore(#[from] RestoreError),
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("restore transport failed: {0}")]
    Transport(#[from] MessagingError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("restored state does not name both parties as participants")]
    InvalidParticipants,
    #[error("restored channel address {got:?} does not match its derivation {expected:?}")]
    InvalidChannelAddress { expected: Address, got: Address },
    #[error("restored state carries missing or invalid signatures")]
    InvalidSignatures,
    #[error("restored merkle root does not commit to the returned transfers")]
    InvalidMerkleRoot,
    #[error("peer nonce {peer} is reachable from local nonce {local} without a restore")]
    SyncableState { local: u64, peer: u64 },
    #[error("failed to persist the restored state: {0}")]
    SaveFailed(#[from] StoreError),
    #[error("failed to lock the channel for restore: {0}")]
    LockFailed(#[from] LockError),
}

#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Wall-clock budget for one request/reply round-trip with the peer.
    pub exchange_timeout: Duration,
    /// How long a served restore may hold the channel lock awaiting
    /// confirmation before the janitor force-releases it.
    pub restore_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(30),
            restore_timeout: Duration::from_secs(45),
        }
    }
}

/// One party's update engine. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct UpdateEngine {
    signer: Arc<Signer>,
    identifier: PublicIdentifier,
    store: Arc<dyn Store>,
    messaging: Arc<dyn Messaging>,
    chain: Arc<dyn ChainReader>,
    locks: Arc<dyn LockService>,
    config: EngineConfig,
    /// Channel → nonce of our own proposal currently in flight; consulted by
    /// the inbound path for the concurrent-proposal tie-break.
    in_flight: Arc<StdMutex<HashMap<Address, u64>>>,
    /// Channel → lock value held on behalf of a served restore, released on
    /// confirmation or by the janitor.
    pending_restores: Arc<StdMutex<HashMap<Address, LockValue>>>,
}

impl UpdateEngine {
    pub fn new(
        signer: Signer,
        store: Arc<dyn Store>,
        messaging: Arc<dyn Messaging>,
        chain: Arc<dyn ChainReader>,
        locks: Arc<dyn LockService>,
        config: EngineConfig,
    ) -> Self {
        let identifier = signer.public_identifier();
        Self {
            signer: Arc::new(signer),
            identifier,
            store,
            messaging,
            chain,
            locks,
            config,
            in_flight: Arc::new(StdMutex::new(HashMap::new())),
            pending_restores: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn public_identifier(&self) -> &PublicIdentifier {
        &self.identifier
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Propose an update and drive it to a countersigned, persisted state.
    ///
    /// Holds the channel lock for the whole round-trip. On success the
    /// returned state is the new persisted head of the channel.
    pub async fn propose(&self, params: UpdateParams) -> Result<ChannelState, ProtocolError> {
        let (channel_address, counterparty, is_alice) = self.routing_for(&params).await?;

        let lock = self
            .locks
            .acquire_lock(channel_address, is_alice, &counterparty)
            .await
            .map_err(|source| ProtocolError::AcquireLockFailed {
                channel: channel_address,
                source,
            })?;

        let result = self
            .propose_locked(&params, channel_address, &counterparty)
            .await;

        self.in_flight.lock().unwrap().remove(&channel_address);
        if let Err(e) = self
            .locks
            .release_lock(channel_address, lock, is_alice, &counterparty)
            .await
        {
            warn!(channel = ?channel_address, error = %e, "failed to release the channel lock");
        }

        result
    }

    async fn propose_locked(
        &self,
        params: &UpdateParams,
        channel_address: Address,
        counterparty: &PublicIdentifier,
    ) -> Result<ChannelState, ProtocolError> {
        let prev = match params {
            UpdateParams::Setup(p) => {
                if self
                    .store
                    .get_channel_state(channel_address)
                    .await?
                    .is_some()
                {
                    return Err(ProtocolError::ChannelExists(channel_address));
                }
                let counterparty_address = p.counterparty_identifier.address().map_err(|_| {
                    GenerateError::InvalidParams("counterparty identifier does not bind an address")
                })?;
                ChannelState::setup_seed(
                    channel_address,
                    p.network_context,
                    [self.signer.address(), counterparty_address],
                    [self.identifier.clone(), p.counterparty_identifier.clone()],
                )
            }
            _ => self
                .store
                .get_channel_state(channel_address)
                .await?
                .ok_or(ProtocolError::ChannelNotFound(channel_address))?,
        };

        let generated = generate_update(
            params,
            &prev,
            self.store.as_ref(),
            self.chain.as_ref(),
            self.signer.as_ref(),
        )
        .await?;
        let active = self.store.get_active_transfers(channel_address).await?;

        // Run our own proposal through the same checks the responder will.
        validate::validate_update(&prev, &generated.update, &active, self.chain.as_ref()).await?;

        self.in_flight
            .lock()
            .unwrap()
            .insert(channel_address, generated.update.nonce);

        debug!(
            channel = ?channel_address,
            nonce = generated.update.nonce,
            update_type = ?generated.update.update_type(),
            to = %counterparty,
            "proposing update"
        );

        let request = UpdateRequest {
            update: generated.update.clone(),
            previous: prev.latest_update.clone(),
        };
        let reply = match timeout(
            self.config.exchange_timeout,
            self.messaging.request_update(counterparty, request),
        )
        .await
        {
            Ok(reply) => reply?,
            Err(_) => return Err(ProtocolError::MessagingTimeout(self.config.exchange_timeout)),
        };

        match reply {
            UpdateReply::Accepted { update } => {
                let update = *update;
                if update.hash() != generated.update.hash() {
                    return Err(ValidationError::Malformed(
                        "countersigned update does not match the proposal",
                    )
                    .into());
                }
                validate::verify_both_signatures(&update, &prev.participants)?;

                let next = apply_update(&prev, &update, generated.transfer.as_ref())
                    .map_err(ValidationError::from)?;
                let active_after = next_active(active, &update, generated.transfer);
                self.store
                    .save_channel_state_and_transfers(&next, &active_after)
                    .await?;

                info!(
                    channel = ?channel_address,
                    nonce = next.nonce,
                    update_type = ?update.update_type(),
                    "update countersigned and persisted"
                );
                Ok(next)
            }
            UpdateReply::Rejected {
                reason,
                channel_nonce,
                message,
            } => {
                if reason == RejectReason::ConcurrentUpdate {
                    return Err(ProtocolError::ConcurrentUpdate {
                        winner: counterparty.clone(),
                    });
                }
                if reason == RejectReason::Stale && channel_nonce > prev.nonce + 1 {
                    // The peer is far ahead of us; catch up in the background
                    // so a retry can succeed.
                    self.spawn_restore(counterparty.clone(), prev.chain_id());
                }
                warn!(
                    channel = ?channel_address,
                    nonce = generated.update.nonce,
                    ?reason,
                    counterparty_nonce = channel_nonce,
                    "proposal rejected"
                );
                Err(ProtocolError::Rejected {
                    reason,
                    channel_nonce,
                    message,
                })
            }
        }
    }

    /// Responder side of the update exchange. Always yields a reply; internal
    /// failures surface to the peer as rejections.
    pub async fn handle_update_request(
        &self,
        from: &PublicIdentifier,
        request: UpdateRequest,
    ) -> UpdateReply {
        let channel_address = request.update.channel_address;

        // Concurrent-proposal tie-break, before touching the lock: if our own
        // proposal for the same nonce is in flight and we hold the smaller
        // identifier, the peer has to yield.
        {
            let in_flight = self.in_flight.lock().unwrap();
            if let Some(&nonce) = in_flight.get(&channel_address) {
                if nonce == request.update.nonce && self.identifier < *from {
                    debug!(
                        channel = ?channel_address,
                        nonce,
                        loser = %from,
                        "rejecting concurrent proposal"
                    );
                    return rejected(
                        RejectReason::ConcurrentUpdate,
                        nonce.saturating_sub(1),
                        "concurrent proposal lost the tie-break",
                    );
                }
            }
        }

        let is_alice = if request.update.update_type() == UpdateType::Setup {
            // The proposer of a setup deploys the channel and takes the alice
            // slot; the responder is bob.
            false
        } else {
            match self.store.get_channel_state(channel_address).await {
                Ok(Some(channel)) => channel.is_alice(&self.identifier),
                Ok(None) => {
                    return rejected(RejectReason::Validation, 0, "unknown channel");
                }
                Err(e) => return rejected(RejectReason::Internal, 0, e),
            }
        };

        let lock = match self.locks.acquire_lock(channel_address, is_alice, from).await {
            Ok(lock) => lock,
            Err(e) => return rejected(RejectReason::Busy, 0, e),
        };

        let reply = self.respond_locked(from, &request).await;

        if let Err(e) = self
            .locks
            .release_lock(channel_address, lock, is_alice, from)
            .await
        {
            warn!(channel = ?channel_address, error = %e, "failed to release the channel lock");
        }

        reply
    }

    async fn respond_locked(&self, from: &PublicIdentifier, request: &UpdateRequest) -> UpdateReply {
        let update = &request.update;
        let channel_address = update.channel_address;

        let mut prev = if update.update_type() == UpdateType::Setup {
            match self.setup_seed_from_inbound(from, update).await {
                Ok(seed) => seed,
                Err(reply) => return reply,
            }
        } else {
            match self.store.get_channel_state(channel_address).await {
                Ok(Some(channel)) => channel,
                Ok(None) => return rejected(RejectReason::Validation, 0, "unknown channel"),
                Err(e) => return rejected(RejectReason::Internal, 0, e),
            }
        };

        match classify_nonce(prev.nonce, update.nonce) {
            NonceStatus::Next => {}
            NonceStatus::Stale => {
                return rejected(RejectReason::Stale, prev.nonce, "stale nonce");
            }
            NonceStatus::OutOfSync => {
                // Exactly one behind is recoverable inline from the peer's
                // previous double-signed update; anything further needs a
                // full restore.
                if update.nonce == prev.nonce + 2 {
                    if let Some(previous) = &request.previous {
                        match self.apply_catch_up(&prev, previous).await {
                            Ok(caught_up) => {
                                info!(
                                    channel = ?channel_address,
                                    nonce = caught_up.nonce,
                                    "caught up one nonce from the peer's previous update"
                                );
                                prev = caught_up;
                            }
                            Err(e) => {
                                self.spawn_restore(from.clone(), prev.chain_id());
                                return rejected(RejectReason::OutOfSync, prev.nonce, e);
                            }
                        }
                    } else {
                        self.spawn_restore(from.clone(), prev.chain_id());
                        return rejected(
                            RejectReason::OutOfSync,
                            prev.nonce,
                            "missing previous update",
                        );
                    }
                } else {
                    self.spawn_restore(from.clone(), prev.chain_id());
                    return rejected(RejectReason::OutOfSync, prev.nonce, "out of sync; restoring");
                }
            }
        }

        let active = match self.store.get_active_transfers(channel_address).await {
            Ok(active) => active,
            Err(e) => return rejected(RejectReason::Internal, prev.nonce, e),
        };

        let validated =
            match validate::validate_update(&prev, update, &active, self.chain.as_ref()).await {
                Ok(validated) => validated,
                Err(e @ ValidationError::StaleUpdate { .. }) => {
                    return rejected(RejectReason::Stale, prev.nonce, e)
                }
                Err(e) => return rejected(RejectReason::Validation, prev.nonce, e),
            };

        let our_index = match prev.participant_index(&self.identifier) {
            Some(index) => index,
            None => {
                return rejected(
                    RejectReason::Validation,
                    prev.nonce,
                    "we are not a participant of this channel",
                )
            }
        };

        let mut signed = update.clone();
        signed.signatures[our_index] = Some(self.signer.sign_eth(signed.hash()));

        let next = match apply_update(&prev, &signed, validated.transfer.as_ref()) {
            Ok(next) => next,
            Err(e) => return rejected(RejectReason::Internal, prev.nonce, e),
        };
        let active_after = next_active(active, &signed, validated.transfer);
        if let Err(e) = self
            .store
            .save_channel_state_and_transfers(&next, &active_after)
            .await
        {
            return rejected(RejectReason::Internal, prev.nonce, e);
        }

        info!(
            channel = ?channel_address,
            nonce = next.nonce,
            update_type = ?signed.update_type(),
            from = %from,
            "inbound update countersigned and persisted"
        );
        UpdateReply::Accepted {
            update: Box::new(signed),
        }
    }

    /// Apply the peer's previous double-signed update to close a gap of
    /// exactly one nonce.
    async fn apply_catch_up(
        &self,
        prev: &ChannelState,
        previous: &Update,
    ) -> Result<ChannelState, ProtocolError> {
        if previous.channel_address != prev.channel_address {
            return Err(ValidationError::ChannelAddressMismatch {
                got: previous.channel_address,
                expected: prev.channel_address,
            }
            .into());
        }
        if previous.nonce != prev.nonce + 1 {
            return Err(ValidationError::InvalidNonce {
                got: previous.nonce,
                expected: prev.nonce + 1,
            }
            .into());
        }
        validate::verify_both_signatures(previous, &prev.participants)?;

        let active = self
            .store
            .get_active_transfers(prev.channel_address)
            .await?;
        let transfer = match &previous.details {
            UpdateDetails::Create { .. } => {
                Some(validate::transfer_from_create(prev, previous)?)
            }
            UpdateDetails::Resolve {
                transfer_id,
                transfer_resolver,
                ..
            } => {
                let mut transfer = active
                    .iter()
                    .find(|t| t.transfer_id == *transfer_id)
                    .cloned()
                    .ok_or(ValidationError::UnknownTransfer {
                        transfer_id: *transfer_id,
                    })?;
                transfer.resolver = Some(transfer_resolver.clone());
                Some(transfer)
            }
            _ => None,
        };

        let next =
            apply_update(prev, previous, transfer.as_ref()).map_err(ValidationError::from)?;
        let active_after = next_active(active, previous, transfer);
        self.store
            .save_channel_state_and_transfers(&next, &active_after)
            .await?;
        Ok(next)
    }

    /// Fetch, verify and atomically adopt the counterparty's authoritative
    /// channel state.
    pub async fn restore_channel(
        &self,
        counterparty: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<ChannelState, RestoreError> {
        let reply = match timeout(
            self.config.exchange_timeout,
            self.messaging
                .request_restore(counterparty, RestoreRequest { chain_id }),
        )
        .await
        {
            Ok(reply) => reply?,
            Err(_) => {
                return Err(RestoreError::Transport(MessagingError::Transport(
                    "restore request timed out".into(),
                )))
            }
        };
        let RestoreReply {
            channel,
            active_transfers,
        } = reply;
        let channel_address = channel.channel_address;

        if channel.participant_index(&self.identifier).is_none()
            || channel.participant_index(counterparty).is_none()
            || channel.chain_id() != chain_id
        {
            return Err(RestoreError::InvalidParticipants);
        }

        let derived = self
            .chain
            .get_channel_address(
                channel.alice(),
                channel.bob(),
                channel.network_context.channel_factory_address,
                chain_id,
            )
            .await?;
        if derived != channel_address {
            return Err(RestoreError::InvalidChannelAddress {
                expected: derived,
                got: channel_address,
            });
        }

        let latest = channel
            .latest_update
            .as_ref()
            .ok_or(RestoreError::InvalidSignatures)?;
        validate::verify_both_signatures(latest, &channel.participants)
            .map_err(|_| RestoreError::InvalidSignatures)?;

        if merkle_root(&active_transfers) != channel.merkle_root {
            return Err(RestoreError::InvalidMerkleRoot);
        }

        let is_alice = channel.is_alice(&self.identifier);
        let lock = self
            .locks
            .acquire_lock(channel_address, is_alice, counterparty)
            .await?;

        let persisted = async {
            let local_nonce = match self.store.get_channel_state(channel_address).await {
                Ok(Some(local)) => local.nonce,
                Ok(None) => 0,
                Err(e) => return Err(RestoreError::SaveFailed(e)),
            };
            if channel.nonce <= local_nonce + 1 {
                return Err(RestoreError::SyncableState {
                    local: local_nonce,
                    peer: channel.nonce,
                });
            }
            self.store
                .save_channel_state_and_transfers(&channel, &active_transfers)
                .await
                .map_err(RestoreError::SaveFailed)
        }
        .await;

        if let Err(e) = self
            .locks
            .release_lock(channel_address, lock, is_alice, counterparty)
            .await
        {
            warn!(channel = ?channel_address, error = %e, "failed to release the channel lock");
        }
        persisted?;

        let confirm = RestoreConfirm {
            channel_address,
            active_transfer_ids: active_transfers.iter().map(|t| t.transfer_id).collect(),
        };
        // Best effort: the serving peer's janitor reclaims the lock if this
        // never arrives.
        if let Err(e) = self
            .messaging
            .send_restore_confirm(counterparty, confirm)
            .await
        {
            warn!(channel = ?channel_address, error = %e, "restore confirmation failed to send");
        }

        info!(
            channel = ?channel_address,
            nonce = channel.nonce,
            transfers = active_transfers.len(),
            "channel restored from counterparty"
        );
        Ok(channel)
    }

    /// Serve the authoritative copy of the shared channel under our lock;
    /// the lock stays held until [`Self::handle_restore_confirm`] or the
    /// janitor releases it.
    pub async fn handle_restore_request(
        &self,
        from: &PublicIdentifier,
        request: RestoreRequest,
    ) -> Result<RestoreReply, ProtocolError> {
        let channel = self
            .store
            .get_channel_state_by_participants(&self.identifier, from, request.chain_id)
            .await?
            .ok_or_else(|| ProtocolError::NoChannelWith {
                counterparty: from.clone(),
                chain_id: request.chain_id,
            })?;
        let channel_address = channel.channel_address;
        let is_alice = channel.is_alice(&self.identifier);

        let lock = self
            .locks
            .acquire_lock(channel_address, is_alice, from)
            .await
            .map_err(|source| ProtocolError::AcquireLockFailed {
                channel: channel_address,
                source,
            })?;

        let served = async {
            let channel = self
                .store
                .get_channel_state(channel_address)
                .await?
                .ok_or(ProtocolError::ChannelNotFound(channel_address))?;
            let active_transfers = self.store.get_active_transfers(channel_address).await?;
            Ok::<_, ProtocolError>(RestoreReply {
                channel,
                active_transfers,
            })
        }
        .await;

        let reply = match served {
            Ok(reply) => reply,
            Err(e) => {
                let _ = self
                    .locks
                    .release_lock(channel_address, lock, is_alice, from)
                    .await;
                return Err(e);
            }
        };

        self.pending_restores
            .lock()
            .unwrap()
            .insert(channel_address, lock.clone());

        debug!(
            channel = ?channel_address,
            nonce = reply.channel.nonce,
            to = %from,
            "serving restore; holding the channel lock until confirmation"
        );

        let engine = self.clone();
        let counterparty = from.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.config.restore_timeout).await;
            let still_pending = {
                let mut pending = engine.pending_restores.lock().unwrap();
                match pending.get(&channel_address) {
                    Some(value) if *value == lock => {
                        pending.remove(&channel_address);
                        true
                    }
                    _ => false,
                }
            };
            if still_pending {
                warn!(
                    channel = ?channel_address,
                    "restore confirmation never arrived; releasing the channel lock"
                );
                let _ = engine
                    .locks
                    .release_lock(channel_address, lock, is_alice, &counterparty)
                    .await;
            }
        });

        Ok(reply)
    }

    /// The restorer persisted our state; release the lock held on its
    /// behalf.
    pub async fn handle_restore_confirm(&self, from: &PublicIdentifier, confirm: RestoreConfirm) {
        let pending = self
            .pending_restores
            .lock()
            .unwrap()
            .remove(&confirm.channel_address);
        let Some(lock) = pending else {
            return;
        };

        let is_alice = match self.store.get_channel_state(confirm.channel_address).await {
            Ok(Some(channel)) => channel.is_alice(&self.identifier),
            _ => true,
        };
        if let Err(e) = self
            .locks
            .release_lock(confirm.channel_address, lock, is_alice, from)
            .await
        {
            warn!(channel = ?confirm.channel_address, error = %e, "failed to release the restore lock");
        }
        debug!(
            channel = ?confirm.channel_address,
            transfers = confirm.active_transfer_ids.len(),
            "restore confirmed"
        );
    }

    fn spawn_restore(&self, counterparty: PublicIdentifier, chain_id: u64) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.restore_channel(&counterparty, chain_id).await {
                Ok(channel) => info!(
                    channel = ?channel.channel_address,
                    nonce = channel.nonce,
                    "background restore finished"
                ),
                Err(e) => warn!(error = %e, "background restore failed"),
            }
        });
    }

    /// Resolve the channel address, counterparty and role for a proposal.
    async fn routing_for(
        &self,
        params: &UpdateParams,
    ) -> Result<(Address, PublicIdentifier, bool), ProtocolError> {
        match params {
            UpdateParams::Setup(p) => {
                let counterparty_address = p.counterparty_identifier.address().map_err(|_| {
                    GenerateError::InvalidParams("counterparty identifier does not bind an address")
                })?;
                let channel_address = self
                    .chain
                    .get_channel_address(
                        self.signer.address(),
                        counterparty_address,
                        p.network_context.channel_factory_address,
                        p.network_context.chain_id,
                    )
                    .await?;
                Ok((channel_address, p.counterparty_identifier.clone(), true))
            }
            UpdateParams::Deposit(p) => self.routing_for_existing(p.channel_address).await,
            UpdateParams::Create(p) => self.routing_for_existing(p.channel_address).await,
            UpdateParams::Resolve(p) => self.routing_for_existing(p.channel_address).await,
        }
    }

    async fn routing_for_existing(
        &self,
        channel_address: Address,
    ) -> Result<(Address, PublicIdentifier, bool), ProtocolError> {
        let channel = self
            .store
            .get_channel_state(channel_address)
            .await?
            .ok_or(ProtocolError::ChannelNotFound(channel_address))?;
        let counterparty = channel
            .counterparty_of(&self.identifier)
            .ok_or(GenerateError::NotAParticipant {
                channel: channel_address,
            })?
            .clone();
        Ok((
            channel_address,
            counterparty,
            channel.is_alice(&self.identifier),
        ))
    }

    /// Build and sanity-check the nonce-0 seed an inbound setup proposal
    /// implies.
    async fn setup_seed_from_inbound(
        &self,
        from: &PublicIdentifier,
        update: &Update,
    ) -> Result<ChannelState, UpdateReply> {
        let UpdateDetails::Setup {
            counterparty_identifier,
            network_context,
            ..
        } = &update.details
        else {
            return Err(rejected(RejectReason::Validation, 0, "expected setup details"));
        };

        if counterparty_identifier != &self.identifier {
            return Err(rejected(
                RejectReason::Validation,
                0,
                "setup addressed to a different party",
            ));
        }
        let alice_address = match from.address() {
            Ok(address) => address,
            Err(_) => {
                return Err(rejected(
                    RejectReason::Validation,
                    0,
                    "proposer identifier does not bind an address",
                ))
            }
        };
        let our_address = self.signer.address();
        if update.balance.to != [alice_address, our_address] {
            return Err(rejected(
                RejectReason::Validation,
                0,
                "setup balance slots must be [alice, bob]",
            ));
        }

        let derived = match self
            .chain
            .get_channel_address(
                alice_address,
                our_address,
                network_context.channel_factory_address,
                network_context.chain_id,
            )
            .await
        {
            Ok(address) => address,
            Err(e) => return Err(rejected(RejectReason::Internal, 0, e)),
        };
        if derived != update.channel_address {
            return Err(rejected(
                RejectReason::Validation,
                0,
                "channel address does not match its derivation",
            ));
        }

        match self.store.get_channel_state(update.channel_address).await {
            Ok(Some(existing)) => Err(rejected(
                RejectReason::Stale,
                existing.nonce,
                "channel already set up",
            )),
            Ok(None) => Ok(ChannelState::setup_seed(
                update.channel_address,
                *network_context,
                [alice_address, our_address],
                [from.clone(), self.identifier.clone()],
            )),
            Err(e) => Err(rejected(RejectReason::Internal, 0, e)),
        }
    }
}

fn rejected(reason: RejectReason, channel_nonce: u64, message: impl ToString) -> UpdateReply {
    UpdateReply::Rejected {
        reason,
        channel_nonce,
        message: message.to_string(),
    }
}

/// The active transfer set after an update: creates enter, resolves leave,
/// everything else passes through.
fn next_active(
    mut active: Vec<Transfer>,
    update: &Update,
    transfer: Option<Transfer>,
) -> Vec<Transfer> {
    match (update.update_type(), transfer) {
        (UpdateType::Create, Some(t)) => active.push(t),
        (UpdateType::Resolve, Some(t)) => active.retain(|a| a.transfer_id != t.transfer_id),
        _ => {}
    }
    active
}
