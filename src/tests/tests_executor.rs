//! Executor scenarios: nonce sequencing, void transactions, lock contention,
//! fee escalation and payment top-ups, all against the in-memory store and
//! the virtual-clock chain protocol.

use std::sync::Arc;

use primitive_types::{H160, U256};
use uuid::Uuid;

use crate::chain::{ChainProtocol, TransactionInclusion, ValidityCheck};
use crate::error::TimeboltError;
use crate::execution::ExecutionKey;
use crate::executor::{
    BroadcastOptions, BroadcastSchedule, BroadcastsExecution, ExecutionToBroadcast, Executor,
    ExecutorConfig, FeeTier,
};
use crate::storage::memory::MemoryStorage;
use crate::storage::ExecutorStorage;

use super::test_utils::{test_executor, transfer, TestChainProtocol, TEST_CHAIN};

const ACCOUNT: H160 = H160::repeat_byte(0xaa);
const PAYMENT_ACCOUNT: H160 = H160::repeat_byte(0xbb);

fn setup(config: ExecutorConfig) -> (Arc<TestChainProtocol>, Arc<MemoryStorage>, Executor) {
    let protocol = Arc::new(TestChainProtocol::new(1_000));
    let storage = Arc::new(MemoryStorage::new());
    let executor = test_executor(protocol.clone(), storage.clone(), config);
    (protocol, storage, executor)
}

fn execution() -> ExecutionToBroadcast {
    ExecutionToBroadcast {
        chain_id: TEST_CHAIN,
        transaction: transfer(21_000),
    }
}

fn options(max_fee: u64) -> BroadcastOptions {
    BroadcastOptions {
        max_fee_per_gas_authorized: U256::from(max_fee),
        ..Default::default()
    }
}

fn tier(fee: u64, duration: u64) -> FeeTier {
    FeeTier {
        max_fee_per_gas: U256::from(fee),
        max_priority_fee_per_gas: U256::from(2),
        duration,
    }
}

#[tokio::test]
async fn nonces_are_sequential_and_a_void_consumes_one() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());

    executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();
    // the second slot fails validation and must burn its nonce as a void
    protocol.set_validity(ValidityCheck {
        revert: true,
        not_enough_gas: false,
    });
    let void_response = executor
        .broadcast_execution("s2", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();
    protocol.set_validity(ValidityCheck {
        revert: false,
        not_enough_gas: false,
    });
    executor
        .broadcast_execution("s3", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();

    let broadcasts = protocol.broadcasts();
    assert_eq!(
        broadcasts.iter().map(|b| b.nonce).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(broadcasts[1].void);
    assert!(void_response.is_void_transaction);
    let row = storage
        .get_broadcaster(TEST_CHAIN, ACCOUNT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.next_nonce, 3);
}

#[tokio::test]
async fn replayed_hand_off_does_not_consume_a_second_nonce() {
    let (protocol, _storage, executor) = setup(ExecutorConfig::default());

    let first = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();
    let replay = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();

    assert_eq!(first, replay);
    assert_eq!(protocol.broadcasts().len(), 1);
}

#[tokio::test]
async fn held_lock_blocks_broadcast_when_not_waiting() {
    let config = ExecutorConfig {
        wait_for_lock: false,
        ..Default::default()
    };
    let (_protocol, storage, executor) = setup(config);
    storage
        .acquire_broadcaster_lock(TEST_CHAIN, ACCOUNT, Uuid::new_v4(), 1_000, 60)
        .await
        .unwrap()
        .unwrap();

    let result = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await;
    assert!(matches!(result, Err(TimeboltError::LockContention(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_broadcasts_serialize_on_the_lock() {
    let (_protocol, storage, executor) = setup(ExecutorConfig::default());

    let (first, second) = tokio::join!(
        executor.broadcast_execution("s1", 0, ACCOUNT, execution(), options(300)),
        executor.broadcast_execution("s2", 0, ACCOUNT, execution(), options(300)),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(first.nonce, second.nonce);
    assert_eq!(first.nonce.min(second.nonce), 0);
    assert_eq!(first.nonce.max(second.nonce), 1);
    let row = storage
        .get_broadcaster(TEST_CHAIN, ACCOUNT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.next_nonce, 2);
}

#[tokio::test]
async fn underfunded_against_worst_case_gas_price_becomes_void() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());
    storage
        .update_expected_worst_case_gas_price(TEST_CHAIN, U256::from(1_000), 1_000)
        .await
        .unwrap();

    let response = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(100))
        .await
        .unwrap();

    assert!(response.is_void_transaction);
    assert!(protocol.broadcasts()[0].void);
}

#[tokio::test]
#[tracing_test::traced_test]
async fn fees_escalate_tier_by_tier_at_a_constant_nonce() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());
    let schedule =
        BroadcastSchedule::new(vec![tier(100, 60), tier(200, 60), tier(300, 60)]).unwrap();
    let mut opts = options(300);
    opts.broadcast_schedule = Some(schedule);

    executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), opts)
        .await
        .unwrap();
    protocol.increase_time(60).await.unwrap();
    let first_pass = executor.process_pending_transactions().await.unwrap();
    assert_eq!(first_pass.escalated, 1);
    protocol.increase_time(60).await.unwrap();
    executor.process_pending_transactions().await.unwrap();
    // far past the last boundary: the last tier is sticky, no further bumps
    protocol.increase_time(600).await.unwrap();
    let final_pass = executor.process_pending_transactions().await.unwrap();
    assert_eq!(final_pass.escalated, 0);

    let broadcasts = protocol.broadcasts();
    assert_eq!(broadcasts.len(), 3);
    let fees: Vec<U256> = broadcasts.iter().map(|b| b.max_fee_per_gas).collect();
    assert_eq!(fees, vec![U256::from(100), U256::from(200), U256::from(300)]);
    assert!(broadcasts.iter().all(|b| b.nonce == 0));
    assert_ne!(broadcasts[0].hash, broadcasts[1].hash);
    assert_ne!(broadcasts[1].hash, broadcasts[2].hash);

    let key = ExecutionKey::new(TEST_CHAIN, ACCOUNT, "s1".to_string());
    let pending = storage.get_pending_execution(&key, 0).await.unwrap().unwrap();
    assert_eq!(pending.hash, broadcasts[2].hash);
    assert_eq!(pending.params.max_fee_per_gas, U256::from(300));
}

#[tokio::test]
async fn finalized_transaction_is_archived() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());
    let response = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();
    protocol.set_status(
        response.hash,
        TransactionInclusion::Finalized {
            block_time: 1_010,
            failed: false,
        },
    );
    protocol.increase_time(100).await.unwrap();

    let pass = executor.process_pending_transactions().await.unwrap();

    assert_eq!(pass.finalized, 1);
    let key = ExecutionKey::new(TEST_CHAIN, ACCOUNT, "s1".to_string());
    assert!(storage.get_pending_execution(&key, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn replay_after_finalization_does_not_rebroadcast() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());
    let first = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();
    protocol.set_status(
        first.hash,
        TransactionInclusion::Finalized {
            block_time: 1_010,
            failed: false,
        },
    );
    protocol.increase_time(100).await.unwrap();
    let pass = executor.process_pending_transactions().await.unwrap();
    assert_eq!(pass.finalized, 1);

    // a crashed hand-off replays after the transaction already settled
    let replay = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();

    assert_eq!(first, replay);
    assert_eq!(protocol.broadcasts().len(), 1);
    let row = storage
        .get_broadcaster(TEST_CHAIN, ACCOUNT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.next_nonce, 1);
}

#[tokio::test]
async fn no_fee_bumps_past_expiry() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());
    let mut opts = options(200);
    opts.broadcast_schedule = Some(BroadcastSchedule::new(vec![tier(100, 60), tier(200, 60)]).unwrap());
    opts.expiry_time = Some(1_030);

    executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), opts)
        .await
        .unwrap();
    protocol.increase_time(60).await.unwrap();

    let pass = executor.process_pending_transactions().await.unwrap();

    assert_eq!(pass.escalated, 0);
    assert_eq!(pass.waiting, 1);
    assert_eq!(protocol.broadcasts().len(), 1);
    let key = ExecutionKey::new(TEST_CHAIN, ACCOUNT, "s1".to_string());
    let pending = storage.get_pending_execution(&key, 0).await.unwrap().unwrap();
    assert_eq!(pending.params.max_fee_per_gas, U256::from(100));
    assert_eq!(pending.retries, 1);
}

#[tokio::test]
async fn payment_account_covers_a_fee_shortfall() {
    let config = ExecutorConfig {
        payment_account: Some(PAYMENT_ACCOUNT),
        ..Default::default()
    };
    let (protocol, storage, executor) = setup(config);
    let mut opts = options(100);
    opts.broadcast_schedule = Some(BroadcastSchedule::new(vec![tier(100, 60), tier(500, 60)]).unwrap());

    executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), opts)
        .await
        .unwrap();
    protocol.increase_time(60).await.unwrap();
    let pass = executor.process_pending_transactions().await.unwrap();
    assert_eq!(pass.escalated, 1);

    let broadcasts = protocol.broadcasts();
    assert_eq!(broadcasts.len(), 3);
    // the top-up goes out from the payment account's own cursor
    assert!(broadcasts[1].payment);
    assert_eq!(broadcasts[1].from, PAYMENT_ACCOUNT);
    assert_eq!(broadcasts[1].nonce, 0);
    // then the stuck transaction is re-broadcast above its own authorization
    assert_eq!(broadcasts[2].from, ACCOUNT);
    assert_eq!(broadcasts[2].nonce, 0);
    assert_eq!(broadcasts[2].max_fee_per_gas, U256::from(500));

    let key = ExecutionKey::new(TEST_CHAIN, ACCOUNT, "s1".to_string());
    let pending = storage.get_pending_execution(&key, 0).await.unwrap().unwrap();
    assert_eq!(pending.helped_for_up_to_gas_price, Some(U256::from(500)));
}

#[tokio::test]
async fn top_up_marker_survives_a_failed_rebroadcast() {
    let config = ExecutorConfig {
        payment_account: Some(PAYMENT_ACCOUNT),
        ..Default::default()
    };
    let (protocol, storage, executor) = setup(config);
    let mut opts = options(100);
    opts.broadcast_schedule = Some(BroadcastSchedule::new(vec![tier(100, 60), tier(500, 60)]).unwrap());

    executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), opts)
        .await
        .unwrap();
    protocol.increase_time(60).await.unwrap();
    // the top-up transfer goes out, then the fee-bump re-broadcast fails
    protocol.plan_broadcast_failures(vec![false, true]);
    let failed_pass = executor.process_pending_transactions().await.unwrap();
    assert_eq!(failed_pass.errors, 1);

    let key = ExecutionKey::new(TEST_CHAIN, ACCOUNT, "s1".to_string());
    let pending = storage.get_pending_execution(&key, 0).await.unwrap().unwrap();
    assert_eq!(pending.helped_for_up_to_gas_price, Some(U256::from(500)));
    assert_eq!(pending.params.max_fee_per_gas, U256::from(100));

    let retry_pass = executor.process_pending_transactions().await.unwrap();
    assert_eq!(retry_pass.escalated, 1);

    let broadcasts = protocol.broadcasts();
    // the shortfall was paid exactly once across both passes
    assert_eq!(broadcasts.iter().filter(|b| b.payment).count(), 1);
    assert_eq!(
        broadcasts.last().unwrap().max_fee_per_gas,
        U256::from(500)
    );
}

#[tokio::test]
async fn payment_account_does_not_top_up_its_own_executions() {
    let config = ExecutorConfig {
        payment_account: Some(ACCOUNT),
        ..Default::default()
    };
    let (protocol, storage, executor) = setup(config);
    let mut opts = options(150);
    opts.broadcast_schedule = Some(BroadcastSchedule::new(vec![tier(100, 60), tier(500, 60)]).unwrap());

    executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), opts)
        .await
        .unwrap();
    protocol.increase_time(60).await.unwrap();
    let pass = executor.process_pending_transactions().await.unwrap();

    // capped at its own authorization instead of contending for the lock
    // this group already holds
    assert_eq!(pass.escalated, 1);
    assert_eq!(pass.errors, 0);
    let broadcasts = protocol.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert!(broadcasts.iter().all(|b| !b.payment));
    assert_eq!(broadcasts[1].max_fee_per_gas, U256::from(150));
    let key = ExecutionKey::new(TEST_CHAIN, ACCOUNT, "s1".to_string());
    let pending = storage.get_pending_execution(&key, 0).await.unwrap().unwrap();
    assert!(pending.helped_for_up_to_gas_price.is_none());
}

#[tokio::test]
async fn shortfall_without_payment_account_caps_at_the_authorization() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());
    let mut opts = options(150);
    opts.broadcast_schedule = Some(BroadcastSchedule::new(vec![tier(100, 60), tier(500, 60)]).unwrap());

    executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), opts)
        .await
        .unwrap();
    protocol.increase_time(60).await.unwrap();
    let pass = executor.process_pending_transactions().await.unwrap();

    assert_eq!(pass.escalated, 1);
    let broadcasts = protocol.broadcasts();
    assert_eq!(broadcasts.len(), 2);
    assert_eq!(broadcasts[1].max_fee_per_gas, U256::from(150));
    let key = ExecutionKey::new(TEST_CHAIN, ACCOUNT, "s1".to_string());
    let pending = storage.get_pending_execution(&key, 0).await.unwrap().unwrap();
    assert!(pending.helped_for_up_to_gas_price.is_none());
}

#[tokio::test]
async fn stored_cursor_is_corrected_upward_from_the_chain() {
    let (protocol, storage, executor) = setup(ExecutorConfig::default());
    // an out-of-band transaction moved the account to nonce 5
    {
        let response = executor
            .broadcast_execution("warmup", 0, ACCOUNT, execution(), options(300))
            .await
            .unwrap();
        assert_eq!(response.nonce, 0);
    }
    protocol.set_nonce(ACCOUNT, 5);

    let response = executor
        .broadcast_execution("s1", 0, ACCOUNT, execution(), options(300))
        .await
        .unwrap();

    assert_eq!(response.nonce, 5);
    let row = storage
        .get_broadcaster(TEST_CHAIN, ACCOUNT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.next_nonce, 6);
}
