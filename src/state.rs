//! Rust representations of the channel data model: the countersigned channel
//! state, updates, conditional transfers and caller-facing update parameters.
//!
//! Assets are tracked in three parallel vectors (`asset_ids`, `balances`,
//! `locked_balance`) keyed by asset index; they grow when a deposit
//! introduces a new asset id and always stay the same length.

use serde::{Deserialize, Serialize};

use crate::abi::{self, AbiEncode, Keccak256Writer, SlotWriter};
use crate::types::{Address, Hash, PublicIdentifier, Signature, U256};

/// On-chain deployment coordinates shared by both parties, fixed at setup.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    pub chain_id: u64,
    pub channel_factory_address: Address,
    pub transfer_registry_address: Address,
}

impl AbiEncode for NetworkContext {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        self.chain_id.encode(w);
        self.channel_factory_address.encode(w);
        self.transfer_registry_address.encode(w);
    }
}

/// A per-asset allocation between two parties. In channel state the slots are
/// positional: index 0 is alice, index 1 is bob. Transfer allocations may
/// name addresses outside the channel; the slots still map positionally.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Balance {
    pub to: [Address; 2],
    pub amount: [U256; 2],
}

impl Balance {
    pub fn new(to: [Address; 2], amount: [U256; 2]) -> Self {
        Self { to, amount }
    }

    /// Sum of both slots; `None` on overflow.
    pub fn total(&self) -> Option<U256> {
        self.amount[0].checked_add(self.amount[1])
    }
}

impl AbiEncode for Balance {
    fn encode<W: SlotWriter>(&self, w: &mut W) {
        self.to.encode(w);
        self.amount.encode(w);
    }
}

#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Setup,
    Deposit,
    Create,
    Resolve,
}

impl UpdateType {
    /// Wire/hash tag. Part of the canonical update hash.
    pub fn tag(self) -> u8 {
        match self {
            UpdateType::Setup => 0,
            UpdateType::Deposit => 1,
            UpdateType::Create => 2,
            UpdateType::Resolve => 3,
        }
    }
}

/// Error for update type tags outside the known range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown update type tag {0}")]
pub struct BadUpdateType(pub u8);

impl TryFrom<u8> for UpdateType {
    type Error = BadUpdateType;

    fn try_from(tag: u8) -> Result<Self, BadUpdateType> {
        match tag {
            0 => Ok(UpdateType::Setup),
            1 => Ok(UpdateType::Deposit),
            2 => Ok(UpdateType::Create),
            3 => Ok(UpdateType::Resolve),
            other => Err(BadUpdateType(other)),
        }
    }
}

/// Type-specific payload of an update. The variant is the update's type.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum UpdateDetails {
    Setup {
        counterparty_identifier: PublicIdentifier,
        timeout: U256,
        network_context: NetworkContext,
    },
    Deposit {
        /// Nonce of the latest reconciled alice-side on-chain deposit.
        latest_deposit_nonce: u64,
    },
    Create {
        transfer_id: Hash,
        /// The allocation locked into the transfer.
        balance: Balance,
        transfer_definition: Address,
        transfer_timeout: U256,
        transfer_initial_state: Vec<u8>,
        transfer_encodings: [String; 2],
        merkle_root: Hash,
        /// Sibling path for the new transfer's leaf; derived data, not part
        /// of the canonical hash.
        merkle_proof: Vec<Hash>,
        /// Routing correlation id carried through to the responder's copy of
        /// the transfer; not part of the canonical hash.
        routing_id: Option<Hash>,
        meta: Option<serde_json::Value>,
    },
    Resolve {
        transfer_id: Hash,
        transfer_resolver: Vec<u8>,
        merkle_root: Hash,
    },
}

impl UpdateDetails {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateDetails::Setup { .. } => UpdateType::Setup,
            UpdateDetails::Deposit { .. } => UpdateType::Deposit,
            UpdateDetails::Create { .. } => UpdateType::Create,
            UpdateDetails::Resolve { .. } => UpdateType::Resolve,
        }
    }

    /// Canonical hash of the payload. `merkle_proof` and `meta` are
    /// excluded: the proof is recomputable from the committed root and meta
    /// is free-form routing metadata the contract never sees.
    pub fn hash(&self) -> Hash {
        let mut w = Keccak256Writer::default();
        self.update_type().tag().encode(&mut w);
        match self {
            UpdateDetails::Setup {
                counterparty_identifier,
                timeout,
                network_context,
            } => {
                counterparty_identifier.as_str().encode(&mut w);
                timeout.encode(&mut w);
                network_context.encode(&mut w);
            }
            UpdateDetails::Deposit {
                latest_deposit_nonce,
            } => {
                latest_deposit_nonce.encode(&mut w);
            }
            UpdateDetails::Create {
                transfer_id,
                balance,
                transfer_definition,
                transfer_timeout,
                transfer_initial_state,
                transfer_encodings,
                merkle_root,
                ..
            } => {
                transfer_id.encode(&mut w);
                balance.encode(&mut w);
                transfer_definition.encode(&mut w);
                transfer_timeout.encode(&mut w);
                transfer_initial_state.encode(&mut w);
                transfer_encodings[0].encode(&mut w);
                transfer_encodings[1].encode(&mut w);
                merkle_root.encode(&mut w);
            }
            UpdateDetails::Resolve {
                transfer_id,
                transfer_resolver,
                merkle_root,
            } => {
                transfer_id.encode(&mut w);
                transfer_resolver.encode(&mut w);
                merkle_root.encode(&mut w);
            }
        }
        w.finalize()
    }
}

/// A proposed or applied state transition. Signature slots are positional:
/// index 0 is alice's, index 1 is bob's.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Update {
    pub channel_address: Address,
    pub nonce: u64,
    pub from_identifier: PublicIdentifier,
    pub to_identifier: PublicIdentifier,
    pub asset_id: Address,
    /// Post-update channel balance for this asset.
    pub balance: Balance,
    pub details: UpdateDetails,
    pub signatures: [Option<Signature>; 2],
}

impl Update {
    pub fn update_type(&self) -> UpdateType {
        self.details.update_type()
    }

    /// Canonical update hash; both signatures bind to this value.
    pub fn hash(&self) -> Hash {
        let mut w = Keccak256Writer::default();
        self.channel_address.encode(&mut w);
        self.update_type().tag().encode(&mut w);
        self.nonce.encode(&mut w);
        self.balance.encode(&mut w);
        self.asset_id.encode(&mut w);
        self.details.hash().encode(&mut w);
        self.from_identifier.as_str().encode(&mut w);
        self.to_identifier.as_str().encode(&mut w);
        w.finalize()
    }
}

/// An active conditional payment locked inside a channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Transfer {
    pub transfer_id: Hash,
    pub channel_address: Address,
    pub chain_id: u64,
    pub asset_id: Address,
    /// Allocation locked at creation; its total is the amount held in
    /// `locked_balance` until resolution.
    pub initial_balance: Balance,
    pub transfer_definition: Address,
    pub transfer_timeout: U256,
    /// ABI-encoded initial state per `encodings[0]`. Opaque to the engine;
    /// interpreted only by the transfer definition via the chain reader.
    pub initial_state: Vec<u8>,
    pub initial_state_hash: Hash,
    /// State and resolver encodings, in that order.
    pub encodings: [String; 2],
    pub resolver: Option<Vec<u8>>,
    pub routing_id: Option<Hash>,
    pub meta: Option<serde_json::Value>,
}

impl Transfer {
    /// Total locked by this transfer; `None` on overflow.
    pub fn locked_total(&self) -> Option<U256> {
        self.initial_balance.total()
    }

    /// The merkle leaf: hash of the ABI-encoded initial state.
    pub fn compute_initial_state_hash(initial_state: &[u8]) -> Hash {
        abi::keccak256(initial_state)
    }

    /// Deterministic transfer id, derived from the channel coordinates, the
    /// definition, the encoded initial state and the nonce of the creating
    /// update. Both parties derive the same id independently.
    pub fn derive_id(
        channel_address: Address,
        transfer_definition: Address,
        transfer_timeout: U256,
        state_encoding: &str,
        initial_state: &[u8],
        channel_nonce: u64,
    ) -> Hash {
        let mut w = Keccak256Writer::default();
        channel_address.encode(&mut w);
        transfer_definition.encode(&mut w);
        transfer_timeout.encode(&mut w);
        state_encoding.encode(&mut w);
        initial_state.encode(&mut w);
        channel_nonce.encode(&mut w);
        w.finalize()
    }
}

/// Canonical shared channel state. Created by a setup update and advanced
/// only through countersigned updates; every update produces a fresh value.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelState {
    pub channel_address: Address,
    pub network_context: NetworkContext,
    /// `[alice, bob]`; alice is the party that deployed the channel.
    pub participants: [Address; 2],
    /// `[alice, bob]`, parallel to `participants`.
    pub public_identifiers: [PublicIdentifier; 2],
    pub nonce: u64,
    /// Dispute window, in blocks.
    pub timeout: U256,
    pub balances: Vec<Balance>,
    pub asset_ids: Vec<Address>,
    /// Per asset: total locked in active transfers.
    pub locked_balance: Vec<U256>,
    /// Commitment over the active transfer set; zero when empty.
    pub merkle_root: Hash,
    pub latest_deposit_nonce: u64,
    pub latest_update: Option<Update>,
}

impl ChannelState {
    /// The pre-setup seed: nonce 0, no assets, no history. `apply_update`
    /// turns this into nonce 1 via a setup update.
    pub fn setup_seed(
        channel_address: Address,
        network_context: NetworkContext,
        participants: [Address; 2],
        public_identifiers: [PublicIdentifier; 2],
    ) -> Self {
        ChannelState {
            channel_address,
            network_context,
            participants,
            public_identifiers,
            nonce: 0,
            timeout: U256::zero(),
            balances: Vec::new(),
            asset_ids: Vec::new(),
            locked_balance: Vec::new(),
            merkle_root: Hash::ZERO,
            latest_deposit_nonce: 0,
            latest_update: None,
        }
    }

    pub fn alice(&self) -> Address {
        self.participants[0]
    }

    pub fn bob(&self) -> Address {
        self.participants[1]
    }

    pub fn chain_id(&self) -> u64 {
        self.network_context.chain_id
    }

    pub fn is_alice(&self, identifier: &PublicIdentifier) -> bool {
        self.public_identifiers[0] == *identifier
    }

    pub fn participant_index(&self, identifier: &PublicIdentifier) -> Option<usize> {
        self.public_identifiers
            .iter()
            .position(|id| id == identifier)
    }

    pub fn counterparty_of(&self, identifier: &PublicIdentifier) -> Option<&PublicIdentifier> {
        match self.participant_index(identifier)? {
            0 => Some(&self.public_identifiers[1]),
            _ => Some(&self.public_identifiers[0]),
        }
    }

    pub fn asset_index(&self, asset_id: Address) -> Option<usize> {
        self.asset_ids.iter().position(|a| *a == asset_id)
    }

    /// Free plus locked funds for the asset at `index`; `None` on overflow
    /// or out-of-range index. Constant across every non-deposit update.
    pub fn asset_total(&self, index: usize) -> Option<U256> {
        let balance = self.balances.get(index)?;
        let locked = self.locked_balance.get(index)?;
        balance.total()?.checked_add(*locked)
    }

    /// Canonical commitment over the state core, shared with the dispute
    /// path. Excludes `latest_update` (whose signatures bind to the update
    /// hash, not to this value).
    pub fn commitment_hash(&self) -> Hash {
        let mut w = Keccak256Writer::default();
        self.channel_address.encode(&mut w);
        self.network_context.encode(&mut w);
        self.participants.encode(&mut w);
        self.public_identifiers[0].as_str().encode(&mut w);
        self.public_identifiers[1].as_str().encode(&mut w);
        self.nonce.encode(&mut w);
        self.timeout.encode(&mut w);
        self.asset_ids.encode(&mut w);
        abi::encode_seq(&self.balances, &mut w);
        self.locked_balance.encode(&mut w);
        self.merkle_root.encode(&mut w);
        self.latest_deposit_nonce.encode(&mut w);
        w.finalize()
    }
}

/// Caller's declarative intent, turned into a concrete [`Update`] by the
/// generator.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum UpdateParams {
    Setup(SetupParams),
    Deposit(DepositParams),
    Create(CreateParams),
    Resolve(ResolveParams),
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SetupParams {
    pub counterparty_identifier: PublicIdentifier,
    pub timeout: U256,
    pub network_context: NetworkContext,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DepositParams {
    pub channel_address: Address,
    pub asset_id: Address,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateParams {
    pub channel_address: Address,
    pub asset_id: Address,
    /// Allocation to lock. Amount slots are positional (alice, bob); `to`
    /// addresses may be outside the channel for routed transfers.
    pub balance: Balance,
    pub transfer_definition: Address,
    pub transfer_timeout: U256,
    pub initial_state: Vec<u8>,
    pub encodings: [String; 2],
    pub routing_id: Option<Hash>,
    pub meta: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ResolveParams {
    pub channel_address: Address,
    pub transfer_id: Hash,
    pub resolver: Vec<u8>,
    pub meta: Option<serde_json::Value>,
}

impl UpdateParams {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateParams::Setup(_) => UpdateType::Setup,
            UpdateParams::Deposit(_) => UpdateType::Deposit,
            UpdateParams::Create(_) => UpdateType::Create,
            UpdateParams::Resolve(_) => UpdateType::Resolve,
        }
    }

    /// The target channel; `None` for setup, whose address is derived.
    pub fn channel_address(&self) -> Option<Address> {
        match self {
            UpdateParams::Setup(_) => None,
            UpdateParams::Deposit(p) => Some(p.channel_address),
            UpdateParams::Create(p) => Some(p.channel_address),
            UpdateParams::Resolve(p) => Some(p.channel_address),
        }
    }
}
