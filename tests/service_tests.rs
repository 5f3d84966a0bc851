//! End-to-end tests through the single-writer service queue and the feed
//! pipeline: normalizer -> bus -> engine.

use rust_decimal_macros::dec;
use std::sync::Arc;
use venue_core::*;

const EQ: InstrumentToken = InstrumentToken(1);
const ALICE: UserId = UserId(1);
const BOB: UserId = UserId(2);

fn catalogue() -> InstrumentCatalogue {
    let mut cat = InstrumentCatalogue::new();
    cat.insert(Instrument::equity(EQ, "INFY", "NSE"));
    cat
}

fn live_engine() -> Engine {
    let mut engine = Engine::new(
        EngineConfig::default(),
        catalogue(),
        Box::new(MemJournal::new()),
    );
    engine.set_time(Timestamp::now());
    engine
}

fn tick_now(price: rust_decimal::Decimal) -> Tick {
    Tick {
        instrument_token: EQ,
        symbol: "INFY".to_string(),
        price: Price::new_unchecked(price),
        volume: 100,
        timestamp: Timestamp::now(),
        exchange: "NSE".to_string(),
        prev_close: None,
    }
}

#[tokio::test]
async fn orders_flow_through_the_queue() {
    let (handle, _task) = spawn_engine(live_engine());

    handle.deposit(ALICE, Cash::new(dec!(100_000))).await.unwrap();
    handle.tick(tick_now(dec!(100))).await.unwrap();

    let order = handle
        .place_order(ALICE, OrderRequest::market(EQ, Side::Buy, dec!(10), "svc-1"))
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Filled);

    let positions = handle.get_positions(ALICE).await.unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].quantity.value(), dec!(10));

    let wallet = handle.get_wallet(ALICE).await.unwrap().unwrap();
    assert_eq!(wallet.balance.value(), dec!(100_000));
    assert!(wallet.blocked_balance.is_positive());
}

/// Two concurrent submissions sharing one idempotency key produce exactly
/// one fill, because the single writer serializes them.
#[tokio::test]
async fn concurrent_retries_fill_once() {
    let (handle, _task) = spawn_engine(live_engine());

    handle.deposit(ALICE, Cash::new(dec!(100_000))).await.unwrap();
    handle.tick(tick_now(dec!(100))).await.unwrap();

    let request = OrderRequest::market(EQ, Side::Buy, dec!(10), "retry-key");
    let first = handle.place_order(ALICE, request.clone());
    let second = handle.place_order(ALICE, request.clone());
    let (first, second) = tokio::join!(first, second);

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.id, second.id);

    let positions = handle.get_positions(ALICE).await.unwrap();
    assert_eq!(positions[0].quantity.value(), dec!(10));

    // one block and one settlement, not two of each
    let txns = handle
        .get_transactions(ALICE, TransactionFilter::default())
        .await
        .unwrap();
    let settlements = txns
        .iter()
        .filter(|t| t.txn_type == TxnType::Settlement)
        .count();
    assert_eq!(settlements, 1);
}

/// Different users are independent: one user's rejection does not disturb
/// another's fill in the same drain of the queue.
#[tokio::test]
async fn users_are_independent() {
    let (handle, _task) = spawn_engine(live_engine());

    handle.deposit(ALICE, Cash::new(dec!(100_000))).await.unwrap();
    handle.deposit(BOB, Cash::new(dec!(50))).await.unwrap();
    handle.tick(tick_now(dec!(100))).await.unwrap();

    let alice_order = handle.place_order(
        ALICE,
        OrderRequest::market(EQ, Side::Buy, dec!(10), "a-1"),
    );
    // bob cannot afford the margin
    let bob_order = handle.place_order(
        BOB,
        OrderRequest::market(EQ, Side::Buy, dec!(10), "b-1"),
    );
    let (alice_order, bob_order) = tokio::join!(alice_order, bob_order);

    assert_eq!(alice_order.unwrap().status, OrderStatus::Filled);
    assert!(matches!(
        bob_order,
        Err(ServiceError::Engine(EngineError::Ledger(_)))
    ));

    let bob_wallet = handle.get_wallet(BOB).await.unwrap().unwrap();
    assert_eq!(bob_wallet.blocked_balance.value(), dec!(0));
}

/// The full pipeline: raw payload -> normalizer -> bus -> engine tap, with a
/// broken consumer in the middle that must not break delivery.
#[tokio::test]
async fn pipeline_delivers_through_failing_consumer() {
    let (handle, _task) = spawn_engine(live_engine());
    handle.deposit(ALICE, Cash::new(dec!(100_000))).await.unwrap();

    // a resting limit order waiting for the stream
    handle.tick(tick_now(dec!(100))).await.unwrap();
    let order = handle
        .place_order(
            ALICE,
            OrderRequest::limit(EQ, Side::Buy, dec!(5), Price::new_unchecked(dec!(95)), "lim-1"),
        )
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::Open);

    struct Broken;
    impl TickConsumer for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        fn on_tick(&self, _tick: &Tick) -> Result<(), venue_core::bus::ConsumerError> {
            Err("always fails".into())
        }
    }

    let mut normalizer = TickNormalizer::new();
    normalizer.map_identity(408065, EQ, "INFY", "NSE");

    let mut bus = TickBus::new();
    bus.register(Arc::new(Broken));
    bus.register(Arc::new(handle.tick_consumer()));

    let now = Timestamp::now().as_secs();
    let raw = serde_json::json!([
        {"instrument_token": 408065, "last_price": 94.5, "timestamp": now}
    ]);
    for tick in normalizer.normalize(&raw, Timestamp::now()) {
        bus.emit(&tick);
    }
    assert_eq!(bus.consumer_errors(), 1);

    // give the writer a moment to drain the tick command
    tokio::task::yield_now().await;
    let wallet_seen = handle.get_wallet(ALICE).await.unwrap();
    assert!(wallet_seen.is_some());

    let positions = handle.get_positions(ALICE).await.unwrap();
    assert_eq!(positions.len(), 1);
    // limit fill at the limit price exactly
    assert_eq!(positions[0].average_price.value(), dec!(95));
}

#[tokio::test]
async fn sweep_runs_on_demand() {
    let (handle, _task) = spawn_engine(live_engine());
    handle.deposit(ALICE, Cash::new(dec!(100_000))).await.unwrap();
    handle.tick(tick_now(dec!(100))).await.unwrap();
    handle
        .place_order(ALICE, OrderRequest::market(EQ, Side::Buy, dec!(10), "s-1"))
        .await
        .unwrap();

    let report = handle.sweep().await.unwrap();
    assert_eq!(report.users_checked, 1);
    assert_eq!(report.liquidations_started, 0);
}
