//! End-to-end tests driving two engines against each other over the
//! in-process transport: full channel lifecycle, concurrent proposals and
//! the restore protocol.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::{rngs::StdRng, SeedableRng};

use sluice::external::{
    DepositRecord, DirectMessaging, DirectRouter, MemoryLockService, MemoryStore, Messaging,
    MessagingError, MockChainReader, Store,
};
use sluice::messages::{RestoreConfirm, RestoreReply, RestoreRequest, UpdateReply, UpdateRequest};
use sluice::sig::Signer;
use sluice::{
    Address, Balance, ChannelState, CreateParams, DepositParams, EngineConfig, NetworkContext,
    ProtocolError, PublicIdentifier, ResolveParams, RestoreError, SetupParams, UpdateEngine,
    UpdateParams, U256,
};

const CHAIN_ID: u64 = 1337;

fn network() -> NetworkContext {
    NetworkContext {
        chain_id: CHAIN_ID,
        channel_factory_address: Address([0xfa; 20]),
        transfer_registry_address: Address([0xfb; 20]),
    }
}

struct Party {
    engine: UpdateEngine,
    store: Arc<MemoryStore>,
    identifier: PublicIdentifier,
    address: Address,
}

async fn make_party(
    signer: Signer,
    chain: Arc<MockChainReader>,
    router: &Arc<DirectRouter>,
    messaging: Arc<dyn Messaging>,
) -> Party {
    let identifier = signer.public_identifier();
    let address = signer.address();
    let store = Arc::new(MemoryStore::new());
    let engine = UpdateEngine::new(
        signer,
        store.clone(),
        messaging,
        chain,
        Arc::new(MemoryLockService::new(Duration::from_secs(5))),
        EngineConfig {
            exchange_timeout: Duration::from_secs(5),
            restore_timeout: Duration::from_secs(2),
        },
    );
    router.register(engine.clone()).await;
    Party {
        engine,
        store,
        identifier,
        address,
    }
}

/// Two engines wired over the direct router. The first party returned is
/// the setup proposer (alice).
async fn make_pair(seed: u64, chain: Arc<MockChainReader>) -> (Party, Party, Arc<DirectRouter>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let router = DirectRouter::new();

    let a_signer = Signer::new(&mut rng);
    let b_signer = Signer::new(&mut rng);
    let a_messaging = Arc::new(DirectMessaging::new(
        router.clone(),
        a_signer.public_identifier(),
    ));
    let b_messaging = Arc::new(DirectMessaging::new(
        router.clone(),
        b_signer.public_identifier(),
    ));

    let a = make_party(a_signer, chain.clone(), &router, a_messaging).await;
    let b = make_party(b_signer, chain, &router, b_messaging).await;
    (a, b, router)
}

async fn setup_channel(alice: &Party, bob: &Party) -> ChannelState {
    alice
        .engine
        .propose(UpdateParams::Setup(SetupParams {
            counterparty_identifier: bob.identifier.clone(),
            timeout: U256::from(800u64),
            network_context: network(),
        }))
        .await
        .expect("setup should succeed")
}

async fn assert_converged(a: &Party, b: &Party, channel: Address) -> ChannelState {
    let ours = a
        .store
        .get_channel_state(channel)
        .await
        .unwrap()
        .expect("alice has the channel");
    let theirs = b
        .store
        .get_channel_state(channel)
        .await
        .unwrap()
        .expect("bob has the channel");
    assert_eq!(ours, theirs, "the two parties' views diverged");

    let our_active = a.store.get_active_transfers(channel).await.unwrap();
    let their_active = b.store.get_active_transfers(channel).await.unwrap();
    let mut our_ids: Vec<_> = our_active.iter().map(|t| t.transfer_id).collect();
    let mut their_ids: Vec<_> = their_active.iter().map(|t| t.transfer_id).collect();
    our_ids.sort();
    their_ids.sort();
    assert_eq!(our_ids, their_ids, "active transfer sets diverged");

    ours
}

#[tokio::test(flavor = "multi_thread")]
async fn full_lifecycle_setup_deposit_create_resolve() {
    let chain = Arc::new(MockChainReader::new());
    let (alice, bob, _router) = make_pair(1, chain.clone()).await;

    // --- setup -----------------------------------------------------------
    let state = setup_channel(&alice, &bob).await;
    let channel = state.channel_address;
    assert_eq!(state.nonce, 1);
    assert_eq!(state.participants, [alice.address, bob.address]);
    assert_converged(&alice, &bob, channel).await;

    // --- bob deposits 17 -------------------------------------------------
    let asset = Address([0xee; 20]);
    chain.set_onchain_balance(channel, asset, U256::from(17u64));

    let state = bob
        .engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .expect("bob's deposit should succeed");
    assert_eq!(state.nonce, 2);
    assert_eq!(
        state.balances[0].amount,
        [U256::zero(), U256::from(17u64)]
    );
    assert_converged(&alice, &bob, channel).await;

    // --- alice deposits 10 via the on-chain record -----------------------
    chain.set_onchain_balance(channel, asset, U256::from(27u64));
    chain.set_deposit(
        channel,
        asset,
        DepositRecord {
            nonce: 1,
            amount: U256::from(10u64),
        },
    );

    let state = alice
        .engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .expect("alice's deposit should succeed");
    assert_eq!(state.nonce, 3);
    assert_eq!(
        state.balances[0].amount,
        [U256::from(10u64), U256::from(17u64)]
    );
    assert_eq!(state.latest_deposit_nonce, 1);
    assert_converged(&alice, &bob, channel).await;

    // --- bob locks 14 into a conditional transfer ------------------------
    let state = bob
        .engine
        .propose(UpdateParams::Create(CreateParams {
            channel_address: channel,
            asset_id: asset,
            balance: Balance::new(
                state.participants,
                [U256::zero(), U256::from(14u64)],
            ),
            transfer_definition: Address([0xdd; 20]),
            transfer_timeout: U256::from(700u64),
            initial_state: vec![0x01, 0x02, 0x03],
            encodings: ["tuple(bytes32 lock)".into(), "tuple(bytes32 pre)".into()],
            routing_id: None,
            meta: None,
        }))
        .await
        .expect("create should succeed");
    assert_eq!(state.nonce, 4);
    assert_eq!(
        state.balances[0].amount,
        [U256::from(10u64), U256::from(3u64)]
    );
    assert_eq!(state.locked_balance[0], U256::from(14u64));
    let converged = assert_converged(&alice, &bob, channel).await;
    assert_ne!(converged.merkle_root, sluice::Hash::ZERO);

    let active = bob.store.get_active_transfers(channel).await.unwrap();
    assert_eq!(active.len(), 1);
    let transfer_id = active[0].transfer_id;

    // --- alice resolves; the resolver pays the full lock to alice --------
    chain.set_resolution(
        transfer_id,
        Balance::new(state.participants, [U256::from(14u64), U256::zero()]),
    );

    let state = alice
        .engine
        .propose(UpdateParams::Resolve(ResolveParams {
            channel_address: channel,
            transfer_id,
            resolver: vec![0x42],
            meta: None,
        }))
        .await
        .expect("resolve should succeed");
    assert_eq!(state.nonce, 5);
    assert_eq!(
        state.balances[0].amount,
        [U256::from(24u64), U256::from(3u64)]
    );
    assert_eq!(state.locked_balance[0], U256::zero());
    assert_eq!(state.merkle_root, sluice::Hash::ZERO);

    let final_state = assert_converged(&alice, &bob, channel).await;
    assert!(bob
        .store
        .get_active_transfers(channel)
        .await
        .unwrap()
        .is_empty());

    // Conservation across the whole run: free + locked still equals the
    // on-chain holdings.
    assert_eq!(final_state.asset_total(0).unwrap(), U256::from(27u64));
}

#[tokio::test(flavor = "multi_thread")]
async fn replayed_setup_is_rejected_as_stale() {
    let chain = Arc::new(MockChainReader::new());
    let (alice, bob, _router) = make_pair(2, chain).await;

    setup_channel(&alice, &bob).await;
    let err = alice
        .engine
        .propose(UpdateParams::Setup(SetupParams {
            counterparty_identifier: bob.identifier.clone(),
            timeout: U256::from(800u64),
            network_context: network(),
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ChannelExists(_)));
}

/// Transport wrapper that delays outgoing update requests, letting a test
/// pin down the interleaving of two concurrent proposals.
struct DelayedMessaging {
    inner: DirectMessaging,
    delay: Duration,
}

#[async_trait]
impl Messaging for DelayedMessaging {
    async fn request_update(
        &self,
        to: &PublicIdentifier,
        request: UpdateRequest,
    ) -> Result<UpdateReply, MessagingError> {
        tokio::time::sleep(self.delay).await;
        self.inner.request_update(to, request).await
    }

    async fn request_restore(
        &self,
        to: &PublicIdentifier,
        request: RestoreRequest,
    ) -> Result<RestoreReply, MessagingError> {
        self.inner.request_restore(to, request).await
    }

    async fn send_restore_confirm(
        &self,
        to: &PublicIdentifier,
        confirm: RestoreConfirm,
    ) -> Result<(), MessagingError> {
        self.inner.send_restore_confirm(to, confirm).await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_proposals_resolve_by_identifier_tie_break() {
    let chain = Arc::new(MockChainReader::new());
    let router = DirectRouter::new();
    let mut rng = StdRng::seed_from_u64(3);
    let signer_x = Signer::new(&mut rng);
    let signer_y = Signer::new(&mut rng);

    // The winner of the tie-break is the smaller identifier; give the
    // LOSER the delayed transport so its request is still in flight when
    // the winner's arrives.
    let (winner_signer, loser_signer) =
        if signer_x.public_identifier() < signer_y.public_identifier() {
            (signer_x, signer_y)
        } else {
            (signer_y, signer_x)
        };

    let winner_messaging = Arc::new(DirectMessaging::new(
        router.clone(),
        winner_signer.public_identifier(),
    ));
    let loser_messaging = Arc::new(DelayedMessaging {
        inner: DirectMessaging::new(router.clone(), loser_signer.public_identifier()),
        delay: Duration::from_millis(300),
    });

    let winner = make_party(winner_signer, chain.clone(), &router, winner_messaging).await;
    let loser = make_party(loser_signer, chain.clone(), &router, loser_messaging).await;

    // Establish and fund a channel; the winner deploys it.
    let state = winner
        .engine
        .propose(UpdateParams::Setup(SetupParams {
            counterparty_identifier: loser.identifier.clone(),
            timeout: U256::from(800u64),
            network_context: network(),
        }))
        .await
        .unwrap();
    let channel = state.channel_address;

    let asset = Address([0xee; 20]);
    chain.set_onchain_balance(channel, asset, U256::from(40u64));
    let state = loser
        .engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .unwrap();
    let participants = state.participants;

    let create_params = |amount: [U256; 2]| {
        UpdateParams::Create(CreateParams {
            channel_address: channel,
            asset_id: asset,
            balance: Balance::new(participants, amount),
            transfer_definition: Address([0xdd; 20]),
            transfer_timeout: U256::from(700u64),
            initial_state: vec![amount[0].low_u64() as u8, amount[1].low_u64() as u8],
            encodings: ["tuple(bytes32 lock)".into(), "tuple(bytes32 pre)".into()],
            routing_id: None,
            meta: None,
        })
    };

    // The loser proposes first but its request dawdles on the wire; the
    // winner proposes while the loser's proposal is in flight.
    let loser_engine = loser.engine.clone();
    let loser_params = create_params([U256::zero(), U256::from(5u64)]);
    let loser_task = tokio::spawn(async move { loser_engine.propose(loser_params).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let winner_result = winner
        .engine
        .propose(create_params([U256::zero(), U256::from(7u64)]))
        .await;
    let loser_result = loser_task.await.unwrap();

    let winner_state = winner_result.expect("the smaller identifier wins the tie-break");
    assert!(matches!(
        loser_result,
        Err(ProtocolError::ConcurrentUpdate { .. })
    ));
    assert_eq!(winner_state.nonce, 3);
    assert_converged(&winner, &loser, channel).await;

    // The loser re-attempts against the new state and succeeds.
    let retried = loser
        .engine
        .propose(create_params([U256::zero(), U256::from(5u64)]))
        .await
        .expect("retry after losing the tie-break should succeed");
    assert_eq!(retried.nonce, 4);
    assert_converged(&winner, &loser, channel).await;
}

/// Advance a funded channel, roll bob back to an old snapshot, and check the
/// explicit restore path end to end.
#[tokio::test(flavor = "multi_thread")]
async fn restore_replaces_a_lagging_party() {
    let chain = Arc::new(MockChainReader::new());
    let (alice, bob, _router) = make_pair(4, chain.clone()).await;

    let state = setup_channel(&alice, &bob).await;
    let channel = state.channel_address;
    let asset = Address([0xee; 20]);
    chain.set_onchain_balance(channel, asset, U256::from(30u64));
    bob.engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .unwrap();

    // Snapshot bob at nonce 2.
    let old_state = bob
        .store
        .get_channel_state(channel)
        .await
        .unwrap()
        .unwrap();
    let old_active = bob.store.get_active_transfers(channel).await.unwrap();

    // Advance two more nonces, leaving a transfer active.
    let state = bob
        .engine
        .propose(UpdateParams::Create(CreateParams {
            channel_address: channel,
            asset_id: asset,
            balance: Balance::new(state.participants, [U256::zero(), U256::from(9u64)]),
            transfer_definition: Address([0xdd; 20]),
            transfer_timeout: U256::from(700u64),
            initial_state: vec![0x07],
            encodings: ["tuple(bytes32 lock)".into(), "tuple(bytes32 pre)".into()],
            routing_id: None,
            meta: None,
        }))
        .await
        .unwrap();
    let state = bob
        .engine
        .propose(UpdateParams::Create(CreateParams {
            channel_address: channel,
            asset_id: asset,
            balance: Balance::new(state.participants, [U256::zero(), U256::from(4u64)]),
            transfer_definition: Address([0xdd; 20]),
            transfer_timeout: U256::from(700u64),
            initial_state: vec![0x08],
            encodings: ["tuple(bytes32 lock)".into(), "tuple(bytes32 pre)".into()],
            routing_id: None,
            meta: None,
        }))
        .await
        .unwrap();
    assert_eq!(state.nonce, 4);

    // Roll bob back to the nonce-2 snapshot: two behind, so restorable.
    bob.store
        .save_channel_state_and_transfers(&old_state, &old_active)
        .await
        .unwrap();

    let restored = bob
        .engine
        .restore_channel(&alice.identifier, CHAIN_ID)
        .await
        .expect("restore should succeed");
    assert_eq!(restored.nonce, 4);
    assert_converged(&alice, &bob, channel).await;

    // The confirmation released alice's lock: she can propose again.
    let active = alice.store.get_active_transfers(channel).await.unwrap();
    chain.set_resolution(
        active[0].transfer_id,
        Balance::new(state.participants, [U256::from(9u64), U256::zero()]),
    );
    alice
        .engine
        .propose(UpdateParams::Resolve(ResolveParams {
            channel_address: channel,
            transfer_id: active[0].transfer_id,
            resolver: vec![0x42],
            meta: None,
        }))
        .await
        .expect("the channel lock must be free after a confirmed restore");
}

#[tokio::test(flavor = "multi_thread")]
async fn restore_rejects_a_gap_of_one_as_syncable() {
    let chain = Arc::new(MockChainReader::new());
    let (alice, bob, _router) = make_pair(5, chain.clone()).await;

    let state = setup_channel(&alice, &bob).await;
    let channel = state.channel_address;
    let asset = Address([0xee; 20]);
    chain.set_onchain_balance(channel, asset, U256::from(30u64));

    let old_state = bob
        .store
        .get_channel_state(channel)
        .await
        .unwrap()
        .unwrap();
    let old_active = bob.store.get_active_transfers(channel).await.unwrap();

    bob.engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .unwrap();

    // One behind only: the previous-update catch-up covers this, restore
    // must refuse.
    bob.store
        .save_channel_state_and_transfers(&old_state, &old_active)
        .await
        .unwrap();

    let err = bob
        .engine
        .restore_channel(&alice.identifier, CHAIN_ID)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RestoreError::SyncableState { local: 1, peer: 2 }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn one_behind_responder_catches_up_from_the_previous_update() {
    let chain = Arc::new(MockChainReader::new());
    let (alice, bob, _router) = make_pair(6, chain.clone()).await;

    let state = setup_channel(&alice, &bob).await;
    let channel = state.channel_address;
    let asset = Address([0xee; 20]);
    chain.set_onchain_balance(channel, asset, U256::from(30u64));

    let old_state = bob
        .store
        .get_channel_state(channel)
        .await
        .unwrap()
        .unwrap();
    let old_active = bob.store.get_active_transfers(channel).await.unwrap();

    bob.engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .unwrap();

    // Bob forgets the deposit; he is exactly one behind.
    bob.store
        .save_channel_state_and_transfers(&old_state, &old_active)
        .await
        .unwrap();

    // Alice's next proposal carries the deposit as `previous`; bob applies
    // it inline and countersigns the new update.
    let state = alice
        .engine
        .propose(UpdateParams::Create(CreateParams {
            channel_address: channel,
            asset_id: asset,
            balance: Balance::new(state.participants, [U256::zero(), U256::from(6u64)]),
            transfer_definition: Address([0xdd; 20]),
            transfer_timeout: U256::from(700u64),
            initial_state: vec![0x09],
            encodings: ["tuple(bytes32 lock)".into(), "tuple(bytes32 pre)".into()],
            routing_id: None,
            meta: None,
        }))
        .await
        .expect("catch-up from the previous update should let the proposal through");
    assert_eq!(state.nonce, 3);
    assert_converged(&alice, &bob, channel).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn far_behind_responder_restores_in_the_background() {
    let chain = Arc::new(MockChainReader::new());
    let (alice, bob, _router) = make_pair(7, chain.clone()).await;

    let state = setup_channel(&alice, &bob).await;
    let channel = state.channel_address;
    let asset = Address([0xee; 20]);
    chain.set_onchain_balance(channel, asset, U256::from(30u64));

    let old_state = bob
        .store
        .get_channel_state(channel)
        .await
        .unwrap()
        .unwrap();
    let old_active = bob.store.get_active_transfers(channel).await.unwrap();

    // Advance alice three nonces ahead of the snapshot.
    bob.engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .unwrap();
    chain.set_onchain_balance(channel, asset, U256::from(31u64));
    bob.engine
        .propose(UpdateParams::Deposit(DepositParams {
            channel_address: channel,
            asset_id: asset,
        }))
        .await
        .unwrap();
    let state = bob
        .engine
        .propose(UpdateParams::Create(CreateParams {
            channel_address: channel,
            asset_id: asset,
            balance: Balance::new(state.participants, [U256::zero(), U256::from(3u64)]),
            transfer_definition: Address([0xdd; 20]),
            transfer_timeout: U256::from(700u64),
            initial_state: vec![0x0a],
            encodings: ["tuple(bytes32 lock)".into(), "tuple(bytes32 pre)".into()],
            routing_id: None,
            meta: None,
        }))
        .await
        .unwrap();
    assert_eq!(state.nonce, 4);

    // Bob falls back to nonce 1: three behind.
    bob.store
        .save_channel_state_and_transfers(&old_state, &old_active)
        .await
        .unwrap();

    let active = alice.store.get_active_transfers(channel).await.unwrap();
    let transfer_id = active[0].transfer_id;
    chain.set_resolution(
        transfer_id,
        Balance::new(state.participants, [U256::from(3u64), U256::zero()]),
    );

    // Alice's proposal bounces with an out-of-sync rejection and bob
    // restores himself in the background.
    let err = alice
        .engine
        .propose(UpdateParams::Resolve(ResolveParams {
            channel_address: channel,
            transfer_id,
            resolver: vec![0x42],
            meta: None,
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Rejected { .. }));

    // Give the background restore a moment.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_converged(&alice, &bob, channel).await;

    // With both parties level again, the resolve goes through.
    let state = alice
        .engine
        .propose(UpdateParams::Resolve(ResolveParams {
            channel_address: channel,
            transfer_id,
            resolver: vec![0x42],
            meta: None,
        }))
        .await
        .expect("retry after the background restore should succeed");
    assert_eq!(state.nonce, 5);
    assert_converged(&alice, &bob, channel).await;
}
