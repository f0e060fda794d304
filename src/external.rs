//! Ports to the world outside the update engine, plus in-memory adapters.
//!
//! The engine only ever touches persistence, the chain, the transport and
//! the lock discipline through these traits; every call may suspend. The
//! adapters here back the test harness and single-process deployments: a
//! process-wide store, a per-party lock table and a direct in-process
//! transport that dispatches straight into the peer engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::abi;
use crate::engine::UpdateEngine;
use crate::messages::{RestoreConfirm, RestoreReply, RestoreRequest, UpdateReply, UpdateRequest};
use crate::state::{Balance, ChannelState, Transfer};
use crate::types::{Address, Hash, PublicIdentifier, U256};

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone)]
pub enum ChainError {
    #[error("chain service failure: {0}")]
    Service(String),
    #[error("no resolution available for transfer {0:?}")]
    CannotResolve(Hash),
}

#[derive(Debug, Error, Clone)]
pub enum MessagingError {
    #[error("no route to {0}")]
    Unreachable(PublicIdentifier),
    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error, Clone)]
pub enum LockError {
    #[error("could not acquire the channel lock within {0:?}")]
    AcquireTimeout(Duration),
    #[error("unknown lock value")]
    UnknownLock,
}

/// Opaque token returned by a successful lock acquisition.
pub type LockValue = String;

/// Durable storage for channel states and transfers. `save` is atomic with
/// respect to the `(channel, active transfer set)` pair.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_channel_state(
        &self,
        channel: Address,
    ) -> Result<Option<ChannelState>, StoreError>;

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, StoreError>;

    async fn get_channel_state_by_participants(
        &self,
        a: &PublicIdentifier,
        b: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, StoreError>;

    async fn get_transfer_state(&self, transfer_id: Hash) -> Result<Option<Transfer>, StoreError>;

    async fn get_active_transfers(&self, channel: Address) -> Result<Vec<Transfer>, StoreError>;

    async fn get_transfer_by_routing_id(
        &self,
        channel: Address,
        routing_id: Hash,
    ) -> Result<Option<Transfer>, StoreError>;

    async fn get_transfers_by_routing_id(
        &self,
        routing_id: Hash,
    ) -> Result<Vec<Transfer>, StoreError>;

    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        active_transfers: &[Transfer],
    ) -> Result<(), StoreError>;
}

/// The latest alice-side deposit record for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositRecord {
    pub nonce: u64,
    pub amount: U256,
}

/// Read access to the chain: deposit reconciliation inputs, transfer
/// resolution and the deterministic channel address derivation.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn get_latest_deposit_by_asset_id(
        &self,
        channel: Address,
        asset_id: Address,
    ) -> Result<DepositRecord, ChainError>;

    async fn get_channel_onchain_balance(
        &self,
        channel: Address,
        asset_id: Address,
    ) -> Result<U256, ChainError>;

    /// Evaluate the transfer definition against the given resolver,
    /// yielding the post-resolution allocation.
    async fn resolve(&self, transfer: &Transfer, resolver: &[u8]) -> Result<Balance, ChainError>;

    async fn get_channel_address(
        &self,
        alice: Address,
        bob: Address,
        factory: Address,
        chain_id: u64,
    ) -> Result<Address, ChainError>;
}

/// Reliable point-to-point transport, addressed by public identifier.
#[async_trait]
pub trait Messaging: Send + Sync {
    async fn request_update(
        &self,
        to: &PublicIdentifier,
        request: UpdateRequest,
    ) -> Result<UpdateReply, MessagingError>;

    async fn request_restore(
        &self,
        to: &PublicIdentifier,
        request: RestoreRequest,
    ) -> Result<RestoreReply, MessagingError>;

    async fn send_restore_confirm(
        &self,
        to: &PublicIdentifier,
        confirm: RestoreConfirm,
    ) -> Result<(), MessagingError>;
}

/// Per-channel mutual exclusion. One party's lock serializes its own
/// state-changing operations on a channel; it is not a distributed lock.
#[async_trait]
pub trait LockService: Send + Sync {
    async fn acquire_lock(
        &self,
        channel: Address,
        is_alice: bool,
        counterparty: &PublicIdentifier,
    ) -> Result<LockValue, LockError>;

    async fn release_lock(
        &self,
        channel: Address,
        lock_value: LockValue,
        is_alice: bool,
        counterparty: &PublicIdentifier,
    ) -> Result<(), LockError>;
}

// ---------------------------------------------------------------------------
// In-memory adapters
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryStoreInner {
    channels: HashMap<Address, ChannelState>,
    /// Every transfer ever seen, keyed by id; resolved transfers stay here
    /// after leaving the active set.
    transfers: HashMap<Hash, Transfer>,
    active: HashMap<Address, Vec<Hash>>,
}

/// Process-local store. A single mutex over the whole record set makes the
/// channel + active-set save atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_channel_state(
        &self,
        channel: Address,
    ) -> Result<Option<ChannelState>, StoreError> {
        Ok(self.inner.lock().await.channels.get(&channel).cloned())
    }

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, StoreError> {
        Ok(self.inner.lock().await.channels.values().cloned().collect())
    }

    async fn get_channel_state_by_participants(
        &self,
        a: &PublicIdentifier,
        b: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .channels
            .values()
            .find(|c| {
                c.chain_id() == chain_id
                    && ((c.public_identifiers[0] == *a && c.public_identifiers[1] == *b)
                        || (c.public_identifiers[0] == *b && c.public_identifiers[1] == *a))
            })
            .cloned())
    }

    async fn get_transfer_state(&self, transfer_id: Hash) -> Result<Option<Transfer>, StoreError> {
        Ok(self.inner.lock().await.transfers.get(&transfer_id).cloned())
    }

    async fn get_active_transfers(&self, channel: Address) -> Result<Vec<Transfer>, StoreError> {
        let inner = self.inner.lock().await;
        let ids = match inner.active.get(&channel) {
            Some(ids) => ids,
            None => return Ok(Vec::new()),
        };
        Ok(ids
            .iter()
            .filter_map(|id| inner.transfers.get(id).cloned())
            .collect())
    }

    async fn get_transfer_by_routing_id(
        &self,
        channel: Address,
        routing_id: Hash,
    ) -> Result<Option<Transfer>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transfers
            .values()
            .find(|t| t.channel_address == channel && t.routing_id == Some(routing_id))
            .cloned())
    }

    async fn get_transfers_by_routing_id(
        &self,
        routing_id: Hash,
    ) -> Result<Vec<Transfer>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .transfers
            .values()
            .filter(|t| t.routing_id == Some(routing_id))
            .cloned()
            .collect())
    }

    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        active_transfers: &[Transfer],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .channels
            .insert(channel.channel_address, channel.clone());
        for t in active_transfers {
            inner.transfers.insert(t.transfer_id, t.clone());
        }
        inner.active.insert(
            channel.channel_address,
            active_transfers.iter().map(|t| t.transfer_id).collect(),
        );
        Ok(())
    }
}

#[derive(Default)]
struct MemoryLockInner {
    locks: HashMap<Address, Arc<Mutex<()>>>,
    held: HashMap<LockValue, OwnedMutexGuard<()>>,
    counter: u64,
}

/// One tokio mutex per channel; acquisition times out, release drops the
/// owned guard looked up by lock value.
pub struct MemoryLockService {
    acquire_timeout: Duration,
    inner: Mutex<MemoryLockInner>,
}

impl MemoryLockService {
    pub fn new(acquire_timeout: Duration) -> Self {
        Self {
            acquire_timeout,
            inner: Mutex::new(MemoryLockInner::default()),
        }
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire_lock(
        &self,
        channel: Address,
        _is_alice: bool,
        _counterparty: &PublicIdentifier,
    ) -> Result<LockValue, LockError> {
        let mutex = {
            let mut inner = self.inner.lock().await;
            inner.locks.entry(channel).or_default().clone()
        };
        let guard = tokio::time::timeout(self.acquire_timeout, mutex.lock_owned())
            .await
            .map_err(|_| LockError::AcquireTimeout(self.acquire_timeout))?;
        let mut inner = self.inner.lock().await;
        inner.counter += 1;
        let value = format!("lock-{}-{}", inner.counter, channel.to_hex());
        inner.held.insert(value.clone(), guard);
        Ok(value)
    }

    async fn release_lock(
        &self,
        _channel: Address,
        lock_value: LockValue,
        _is_alice: bool,
        _counterparty: &PublicIdentifier,
    ) -> Result<(), LockError> {
        let mut inner = self.inner.lock().await;
        inner
            .held
            .remove(&lock_value)
            .map(drop)
            .ok_or(LockError::UnknownLock)
    }
}

/// Routes requests straight into registered peer engines. In-process only;
/// a production deployment puts a real transport behind [`Messaging`].
#[derive(Default)]
pub struct DirectRouter {
    peers: RwLock<HashMap<PublicIdentifier, UpdateEngine>>,
}

impl DirectRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, engine: UpdateEngine) {
        let id = engine.public_identifier().clone();
        self.peers.write().await.insert(id, engine);
    }

    async fn peer(&self, to: &PublicIdentifier) -> Result<UpdateEngine, MessagingError> {
        self.peers
            .read()
            .await
            .get(to)
            .cloned()
            .ok_or_else(|| MessagingError::Unreachable(to.clone()))
    }
}

/// One party's [`Messaging`] handle onto a [`DirectRouter`].
pub struct DirectMessaging {
    router: Arc<DirectRouter>,
    local: PublicIdentifier,
}

impl DirectMessaging {
    pub fn new(router: Arc<DirectRouter>, local: PublicIdentifier) -> Self {
        Self { router, local }
    }
}

#[async_trait]
impl Messaging for DirectMessaging {
    async fn request_update(
        &self,
        to: &PublicIdentifier,
        request: UpdateRequest,
    ) -> Result<UpdateReply, MessagingError> {
        let peer = self.router.peer(to).await?;
        Ok(peer.handle_update_request(&self.local, request).await)
    }

    async fn request_restore(
        &self,
        to: &PublicIdentifier,
        request: RestoreRequest,
    ) -> Result<RestoreReply, MessagingError> {
        let peer = self.router.peer(to).await?;
        peer.handle_restore_request(&self.local, request)
            .await
            .map_err(|e| MessagingError::Transport(e.to_string()))
    }

    async fn send_restore_confirm(
        &self,
        to: &PublicIdentifier,
        confirm: RestoreConfirm,
    ) -> Result<(), MessagingError> {
        let peer = self.router.peer(to).await?;
        peer.handle_restore_confirm(&self.local, confirm).await;
        Ok(())
    }
}

#[derive(Default)]
struct MockChainInner {
    deposits: HashMap<(Address, Address), DepositRecord>,
    onchain: HashMap<(Address, Address), U256>,
    resolutions: HashMap<Hash, Balance>,
}

/// Scripted chain reader for tests. Channel addresses derive
/// deterministically from the participant pair, so independent parties
/// agree without touching a chain.
#[derive(Default)]
pub struct MockChainReader {
    inner: std::sync::Mutex<MockChainInner>,
}

impl MockChainReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_deposit(&self, channel: Address, asset_id: Address, record: DepositRecord) {
        self.inner
            .lock()
            .unwrap()
            .deposits
            .insert((channel, asset_id), record);
    }

    pub fn set_onchain_balance(&self, channel: Address, asset_id: Address, amount: U256) {
        self.inner
            .lock()
            .unwrap()
            .onchain
            .insert((channel, asset_id), amount);
    }

    pub fn set_resolution(&self, transfer_id: Hash, resolved: Balance) {
        self.inner
            .lock()
            .unwrap()
            .resolutions
            .insert(transfer_id, resolved);
    }

    /// The same derivation every party computes locally.
    pub fn derive_channel_address(
        alice: Address,
        bob: Address,
        factory: Address,
        chain_id: u64,
    ) -> Address {
        let mut buf = Vec::with_capacity(20 * 3 + 8);
        buf.extend_from_slice(&alice.0);
        buf.extend_from_slice(&bob.0);
        buf.extend_from_slice(&factory.0);
        buf.extend_from_slice(&chain_id.to_be_bytes());
        let hash = abi::keccak256(&buf);
        let mut addr = Address([0; 20]);
        addr.0.copy_from_slice(&hash.0[12..]);
        addr
    }
}

#[async_trait]
impl ChainReader for MockChainReader {
    async fn get_latest_deposit_by_asset_id(
        &self,
        channel: Address,
        asset_id: Address,
    ) -> Result<DepositRecord, ChainError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .deposits
            .get(&(channel, asset_id))
            .copied()
            .unwrap_or(DepositRecord {
                nonce: 0,
                amount: U256::zero(),
            }))
    }

    async fn get_channel_onchain_balance(
        &self,
        channel: Address,
        asset_id: Address,
    ) -> Result<U256, ChainError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .onchain
            .get(&(channel, asset_id))
            .copied()
            .unwrap_or_else(U256::zero))
    }

    async fn resolve(&self, transfer: &Transfer, _resolver: &[u8]) -> Result<Balance, ChainError> {
        self.inner
            .lock()
            .unwrap()
            .resolutions
            .get(&transfer.transfer_id)
            .copied()
            .ok_or(ChainError::CannotResolve(transfer.transfer_id))
    }

    async fn get_channel_address(
        &self,
        alice: Address,
        bob: Address,
        factory: Address,
        chain_id: u64,
    ) -> Result<Address, ChainError> {
        Ok(Self::derive_channel_address(alice, bob, factory, chain_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    fn id(byte: u8) -> PublicIdentifier {
        PublicIdentifier::from_address(addr(byte))
    }

    #[tokio::test]
    async fn lock_serializes_and_releases() {
        let locks = MemoryLockService::new(Duration::from_millis(50));
        let channel = addr(0xcc);

        let value = locks.acquire_lock(channel, true, &id(0x0b)).await.unwrap();
        // Second acquisition times out while the first is held.
        assert!(matches!(
            locks.acquire_lock(channel, true, &id(0x0b)).await,
            Err(LockError::AcquireTimeout(_))
        ));

        locks
            .release_lock(channel, value, true, &id(0x0b))
            .await
            .unwrap();
        let again = locks.acquire_lock(channel, true, &id(0x0b)).await.unwrap();
        locks
            .release_lock(channel, again, true, &id(0x0b))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn release_of_unknown_lock_fails() {
        let locks = MemoryLockService::default();
        assert!(matches!(
            locks
                .release_lock(addr(0xcc), "bogus".into(), true, &id(0x0b))
                .await,
            Err(LockError::UnknownLock)
        ));
    }

    #[tokio::test]
    async fn locks_on_distinct_channels_are_independent() {
        let locks = MemoryLockService::new(Duration::from_millis(50));
        let a = locks.acquire_lock(addr(0x01), true, &id(0x0b)).await.unwrap();
        let b = locks.acquire_lock(addr(0x02), true, &id(0x0b)).await.unwrap();
        locks.release_lock(addr(0x01), a, true, &id(0x0b)).await.unwrap();
        locks.release_lock(addr(0x02), b, true, &id(0x0b)).await.unwrap();
    }

    #[test]
    fn channel_address_derivation_is_deterministic() {
        let one =
            MockChainReader::derive_channel_address(addr(0x0a), addr(0x0b), addr(0xfa), 1337);
        let two =
            MockChainReader::derive_channel_address(addr(0x0a), addr(0x0b), addr(0xfa), 1337);
        assert_eq!(one, two);
        let other =
            MockChainReader::derive_channel_address(addr(0x0b), addr(0x0a), addr(0xfa), 1337);
        assert_ne!(one, other);
    }
}
