//! Simulated venue core walkthrough.
//!
//! Drives the engine through its full lifecycle: deposits, fills against a
//! price stream, mark-to-market, forced liquidation, ledger audit, and the
//! feed supervision pipeline.

use rust_decimal_macros::dec;
use std::sync::Arc;
use venue_core::*;

fn catalogue() -> InstrumentCatalogue {
    let mut cat = InstrumentCatalogue::new();
    cat.insert(Instrument::equity(InstrumentToken(1), "INFY", "NSE"));
    cat.insert(Instrument::future(
        InstrumentToken(101),
        "NIFTY25AUGFUT",
        "NFO",
        50,
        chrono::NaiveDate::from_ymd_opt(2025, 8, 28).unwrap(),
    ));
    cat
}

fn new_engine() -> Engine {
    let mut engine = Engine::new(
        EngineConfig::default(),
        catalogue(),
        Box::new(MemJournal::new()),
    );
    engine.set_time(Timestamp::from_secs(1_000));
    engine
}

fn tick(token: InstrumentToken, symbol: &str, price: rust_decimal::Decimal, ts: i64) -> Tick {
    Tick {
        instrument_token: token,
        symbol: symbol.to_string(),
        price: Price::new_unchecked(price),
        volume: 100,
        timestamp: Timestamp::from_secs(ts),
        exchange: "NSE".to_string(),
        prev_close: None,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    println!("Simulated Venue Core Engine");
    println!("Single feed, margin-blocked wallets, forced liquidation\n");

    scenario_1_market_fill();
    scenario_2_resting_limits();
    scenario_3_pnl_and_audit();
    scenario_4_liquidation();
    scenario_5_feed_pipeline().await;

    println!("\nAll scenarios completed.");
}

/// Market order against the latest tick, slippage charged to the taker.
fn scenario_1_market_fill() {
    println!("Scenario 1: Market Fill\n");

    let mut engine = new_engine();
    let alice = UserId(1);

    engine.deposit(alice, Cash::new(dec!(100_000))).unwrap();
    engine
        .on_tick(tick(InstrumentToken(1), "INFY", dec!(1520.50), 1_000))
        .unwrap();
    println!("  Alice deposits 100,000; INFY ticks at 1520.50");

    let order = engine
        .place_order(
            alice,
            OrderRequest::market(InstrumentToken(1), Side::Buy, dec!(10), "s1-buy"),
        )
        .unwrap();
    println!(
        "  BUY 10 INFY market -> {:?} @ {}",
        order.status,
        order.execution_price.unwrap()
    );

    let wallet = engine.get_wallet(alice).unwrap();
    println!(
        "  wallet: balance {} blocked {}\n",
        wallet.balance, wallet.blocked_balance
    );
}

/// Limit orders rest until the stream crosses them.
fn scenario_2_resting_limits() {
    println!("Scenario 2: Resting Limit Orders\n");

    let mut engine = new_engine();
    let bob = UserId(2);

    engine.deposit(bob, Cash::new(dec!(50_000))).unwrap();
    engine
        .on_tick(tick(InstrumentToken(1), "INFY", dec!(1520), 1_000))
        .unwrap();

    let order = engine
        .place_order(
            bob,
            OrderRequest::limit(
                InstrumentToken(1),
                Side::Buy,
                dec!(10),
                Price::new_unchecked(dec!(1500)),
                "s2-buy",
            ),
        )
        .unwrap();
    println!("  BUY 10 INFY limit 1500 -> {:?}", order.status);

    engine
        .on_tick(tick(InstrumentToken(1), "INFY", dec!(1510), 1_001))
        .unwrap();
    println!(
        "  tick 1510 -> still {:?}",
        engine.get_order(order.id).unwrap().status
    );

    let report = engine
        .on_tick(tick(InstrumentToken(1), "INFY", dec!(1499), 1_002))
        .unwrap();
    let filled = engine.get_order(order.id).unwrap();
    println!(
        "  tick 1499 -> {} fill(s), executed @ {} (limit exactly)\n",
        report.fills,
        filled.execution_price.unwrap()
    );
}

/// Mark-to-market, close, and ledger replay audit.
fn scenario_3_pnl_and_audit() {
    println!("Scenario 3: PnL and Ledger Audit\n");

    let mut engine = new_engine();
    let carol = UserId(3);

    engine.deposit(carol, Cash::new(dec!(500_000))).unwrap();
    engine
        .on_tick(tick(InstrumentToken(101), "NIFTY25AUGFUT", dec!(24_000), 1_000))
        .unwrap();

    engine
        .place_order(
            carol,
            OrderRequest::market(InstrumentToken(101), Side::Buy, dec!(50), "s3-buy"),
        )
        .unwrap();
    println!("  BUY 50 NIFTY futures at ~24,000 (15% margin blocked)");

    engine
        .on_tick(tick(InstrumentToken(101), "NIFTY25AUGFUT", dec!(24_200), 1_010))
        .unwrap();
    let snap = engine.snapshot_for(carol).unwrap();
    println!(
        "  tick 24,200 -> unrealized {} equity {} required {}",
        snap.unrealized_pnl, snap.equity, snap.required_margin
    );

    let close = engine.close_position(carol, InstrumentToken(101), None).unwrap();
    println!(
        "  close fills @ {} -> realized into wallet",
        close.execution_price.unwrap()
    );

    let rebuilt = engine.recalculate_wallet(carol).unwrap();
    let cached = engine.get_wallet(carol).unwrap();
    println!(
        "  audit replay: cached balance {} == replayed {}\n",
        cached.balance, rebuilt.balance
    );
    assert_eq!(cached.balance, rebuilt.balance);
}

/// A crashing future breaches maintenance and is force-closed.
fn scenario_4_liquidation() {
    println!("Scenario 4: Forced Liquidation\n");

    let mut engine = new_engine();
    let dave = UserId(4);

    engine.deposit(dave, Cash::new(dec!(200_000))).unwrap();
    engine
        .on_tick(tick(InstrumentToken(101), "NIFTY25AUGFUT", dec!(24_000), 1_000))
        .unwrap();
    engine
        .place_order(
            dave,
            OrderRequest::market(InstrumentToken(101), Side::Buy, dec!(50), "s4-buy"),
        )
        .unwrap();

    let snap = engine.snapshot_for(dave).unwrap();
    println!(
        "  long 50 futures; required margin {} maintenance {}",
        snap.required_margin, snap.maintenance_margin
    );

    let report = engine
        .on_tick(tick(InstrumentToken(101), "NIFTY25AUGFUT", dec!(22_300), 1_010))
        .unwrap();
    println!(
        "  tick 22,300 -> liquidations started: {}",
        report.liquidations_started
    );

    let wallet = engine.get_wallet(dave).unwrap();
    println!(
        "  after forced close: state {:?}, balance {}, positions {}\n",
        wallet.account_state,
        wallet.balance,
        engine.get_positions(dave).len()
    );
}

/// Feed supervision: batching, grace periods, normalization, fan-out, and
/// the single-writer service loop.
async fn scenario_5_feed_pipeline() {
    println!("Scenario 5: Feed Pipeline\n");

    struct PrintingUpstream;

    impl UpstreamFeed for PrintingUpstream {
        fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
            println!("  upstream subscribe: {symbols:?}");
            Ok(())
        }

        fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
            println!("  upstream unsubscribe: {symbols:?}");
            Ok(())
        }
    }

    let supervisor = FeedSupervisor::new(FeedConfig::default(), Arc::new(PrintingUpstream));

    // three pages subscribe to overlapping symbols: one upstream call
    supervisor.add_subscription("INFY");
    supervisor.add_subscription("INFY");
    supervisor.add_subscription("NIFTY25AUGFUT");
    supervisor.flush_pending();
    println!(
        "  active symbols: {:?}, INFY refs: {}",
        supervisor.active_symbols(),
        supervisor.ref_count("INFY")
    );

    // churn is absorbed by the grace period
    supervisor.remove_subscription("INFY");
    supervisor.remove_subscription("INFY");
    supervisor.add_subscription("INFY");
    println!("  churned INFY within grace: no upstream traffic");

    // normalize a raw vendor payload and fan it out through the service
    let mut engine = new_engine();
    let erin = UserId(5);
    engine.set_time(Timestamp::now());
    engine.deposit(erin, Cash::new(dec!(100_000))).unwrap();
    let (handle, _task) = spawn_engine(engine);

    let mut normalizer = TickNormalizer::new();
    normalizer.map_identity(408065, InstrumentToken(1), "INFY", "NSE");

    let mut bus = TickBus::new();
    bus.register(Arc::new(handle.tick_consumer()));

    let raw = serde_json::json!({
        "data": [
            {"instrument_token": 408065, "last_price": 1520.50, "volume": 900},
            {"instrument_token": 999, "ltp": 42.0},
            "garbage"
        ]
    });
    let ticks = normalizer.normalize(&raw, Timestamp::now());
    println!(
        "  normalized {} tick(s) from a messy payload (1 unresolved kept visible)",
        ticks.len()
    );
    for t in &ticks {
        supervisor.record_tick(t.timestamp);
        bus.emit(t);
    }

    let order = handle
        .place_order(
            erin,
            OrderRequest::market(InstrumentToken(1), Side::Buy, dec!(5), "s5-buy"),
        )
        .await
        .unwrap();
    println!(
        "  order through the service queue -> {:?} @ {}",
        order.status,
        order.execution_price.unwrap()
    );

    let health = health_snapshot(&supervisor, chrono::Utc::now(), Timestamp::now());
    println!(
        "  health: {} active symbol(s), {} tick(s) seen, session {:?}",
        health.active_symbol_count, health.ticks_seen, health.session
    );
}
