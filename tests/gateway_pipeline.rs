//! End-to-end pipeline tests against a scripted mock gateway
//!
//! A real TCP server speaks the gateway protocol: handshake, heartbeats,
//! order acks, open-order snapshots. Tests drive the full stack (session
//! manager, broker, persistent listeners, order pipeline, auto-linker)
//! and assert on what lands in the store.

use chrono::Utc;
use edgebot_backend::config::GatewayConfig;
use edgebot_backend::ensemble::scorer::SHOULD_TRADE_THRESHOLD;
use edgebot_backend::errors::CoreError;
use edgebot_backend::gateway::broker::RequestBroker;
use edgebot_backend::gateway::session::SessionManager;
use edgebot_backend::gateway::wire::{
    decode_request, encode_frame, GatewayEvent, GatewayRequest, WireExecution,
};
use edgebot_backend::linker::AutoLinker;
use edgebot_backend::models::{
    Direction, EnsembleResult, Evaluation, FeatureVector, LinkType, OrderSide, ProviderId,
};
use edgebot_backend::orders::{
    attach_persistent_listeners, BracketIntent, OrderChanges, OrderIntent, OrderPipeline,
};
use edgebot_backend::storage::TradeStore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

struct MockGateway {
    port: u16,
    inject: mpsc::UnboundedSender<GatewayEvent>,
}

async fn send_event(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    event: &GatewayEvent,
) -> std::io::Result<()> {
    let line = encode_frame(event).expect("events always encode");
    write_half.write_all(line.as_bytes()).await
}

impl MockGateway {
    fn inject(&self, event: GatewayEvent) {
        self.inject.send(event).expect("mock gateway gone");
    }
}

/// Scripted gateway: acks the handshake, answers heartbeats, confirms
/// orders as Submitted, and serves open-order snapshots from what it
/// has seen. Extra events (fills, commissions) arrive via `inject`.
async fn start_mock_gateway() -> MockGateway {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();
            let mut open_orders: Vec<(i64, edgebot_backend::gateway::wire::WireOrder, String)> =
                Vec::new();

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Ok(Some(line)) = line else { break };
                        let Ok(request) = decode_request(&line) else { continue };
                        let replies: Vec<GatewayEvent> = match request {
                            GatewayRequest::StartApi { client_id } => vec![GatewayEvent::ConnectAck {
                                server_version: 178,
                                client_id,
                                next_order_id: 100,
                            }],
                            GatewayRequest::Heartbeat { seq } => vec![GatewayEvent::HeartbeatAck { seq }],
                            GatewayRequest::PlaceOrder { order } => {
                                let order_id = order.order_id;
                                let quantity = order.quantity;
                                match open_orders.iter().position(|(id, _, _)| *id == order_id) {
                                    Some(slot) => open_orders[slot].1 = order.clone(),
                                    None => open_orders.push((
                                        order_id,
                                        order.clone(),
                                        "Submitted".to_string(),
                                    )),
                                }
                                vec![GatewayEvent::OrderStatus {
                                    order_id,
                                    status: "Submitted".to_string(),
                                    filled: 0.0,
                                    remaining: quantity,
                                    avg_fill_price: 0.0,
                                }]
                            }
                            GatewayRequest::CancelOrder { order_id } => {
                                open_orders.retain(|(id, _, _)| *id != order_id);
                                vec![GatewayEvent::OrderStatus {
                                    order_id,
                                    status: "Cancelled".to_string(),
                                    filled: 0.0,
                                    remaining: 0.0,
                                    avg_fill_price: 0.0,
                                }]
                            }
                            GatewayRequest::ReqOpenOrders { req_id } => {
                                let mut replies: Vec<GatewayEvent> = open_orders
                                    .iter()
                                    .map(|(_, order, status)| GatewayEvent::OpenOrder {
                                        req_id: Some(req_id),
                                        order: order.clone(),
                                        status: status.clone(),
                                    })
                                    .collect();
                                replies.push(GatewayEvent::OpenOrderEnd { req_id });
                                replies
                            }
                            GatewayRequest::ReqPositions { req_id } => {
                                vec![GatewayEvent::PositionEnd { req_id }]
                            }
                            _ => Vec::new(),
                        };
                        for event in &replies {
                            if send_event(&mut write_half, event).await.is_err() {
                                break;
                            }
                        }
                    }
                    event = inject_rx.recv() => {
                        let Some(event) = event else { return };
                        if send_event(&mut write_half, &event).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    MockGateway {
        port,
        inject: inject_tx,
    }
}

fn gateway_config(port: u16) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_string(),
        port,
        client_id: 1,
        max_client_id_retries: 3,
        order_timeout_ms: 1_000,
        execution_timeout_ms: 2_000,
        heartbeat_interval_ms: 60_000,
        flatten_settle_ms: 10,
    }
}

struct Stack {
    session: Arc<SessionManager>,
    store: Arc<TradeStore>,
    pipeline: OrderPipeline,
    _linker: Arc<AutoLinker>,
}

async fn build_stack(port: u16) -> Stack {
    let store = Arc::new(TradeStore::open_in_memory().unwrap());
    let broker = Arc::new(RequestBroker::new());
    let session = SessionManager::new(gateway_config(port), Arc::clone(&broker));

    let (linker_tx, linker_rx) = mpsc::unbounded_channel();
    attach_persistent_listeners(&broker, Arc::clone(&store), linker_tx);

    let linker = AutoLinker::with_debounce(Arc::clone(&store), Duration::from_millis(50));
    tokio::spawn(Arc::clone(&linker).run(linker_rx));
    tokio::spawn(Arc::clone(&session).run());

    session
        .with_session(Duration::from_secs(2))
        .await
        .expect("mock gateway should accept the session");

    let pipeline = OrderPipeline::new(
        Arc::clone(&session),
        Arc::clone(&store),
        gateway_config(port),
    );
    Stack {
        session,
        store,
        pipeline,
        _linker: linker,
    }
}

fn evaluation(id: &str, symbol: &str, entry: f64, stop: f64) -> Evaluation {
    Evaluation {
        id: id.to_string(),
        symbol: symbol.to_string(),
        direction: Direction::Long,
        entry_price: Some(entry),
        stop_price: Some(stop),
        created_at: Utc::now(),
        features: FeatureVector::default(),
        ensemble: EnsembleResult {
            weighted_score: 70.0,
            median_score: 70.0,
            final_score: 70.0,
            expected_rr: Some(2.0),
            confidence: 0.8,
            should_trade: 70.0 >= SHOULD_TRADE_THRESHOLD,
            unanimous: true,
            majority_trade: true,
            score_spread: 0.0,
            disagreement_penalty: 0.0,
            providers_used: vec![ProviderId::Gpt],
        },
        weights_used: HashMap::from([(ProviderId::Gpt, 1.0)]),
        guardrail_allowed: true,
        prefilter_passed: true,
    }
}

fn fill(exec_id: &str, order_id: i64, side: &str, shares: f64, price: f64) -> GatewayEvent {
    GatewayEvent::ExecDetails {
        req_id: None,
        execution: WireExecution {
            exec_id: exec_id.to_string(),
            order_id,
            symbol: "AAPL".to_string(),
            side: side.to_string(),
            shares,
            price,
            cum_qty: shares,
            avg_price: price,
            account: Some("DU000001".to_string()),
            time: Utc::now().timestamp_millis(),
        },
    }
}

#[tokio::test]
async fn simple_order_round_trip() {
    let gateway = start_mock_gateway().await;
    let stack = build_stack(gateway.port).await;

    let result = stack
        .pipeline
        .place_order(OrderIntent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: "LMT".to_string(),
            quantity: 100.0,
            limit_price: Some(150.0),
            aux_price: None,
            trailing_percent: None,
            time_in_force: "DAY".to_string(),
            oca_type: None,
            discretionary_amount: None,
            evaluation_id: None,
            order_source: "test".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(result.status, "Submitted");
    assert_eq!(result.order_id, 100);

    let order = stack.store.get_order(100).unwrap().unwrap();
    assert_eq!(order.symbol, "AAPL");
    assert_eq!(order.correlation_id, result.correlation_id);
    stack.session.close();
}

#[tokio::test]
async fn bracket_modify_preserves_children() {
    let gateway = start_mock_gateway().await;
    let stack = build_stack(gateway.port).await;

    let bracket = stack
        .pipeline
        .place_advanced_bracket(BracketIntent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            quantity: 100.0,
            entry_type: "MKT".to_string(),
            entry_limit: None,
            take_profit: 110.0,
            stop_loss: 95.0,
            stop_type: "STP".to_string(),
            trailing_percent: None,
            time_in_force: "GTC".to_string(),
            oca_type: None,
            evaluation_id: None,
        })
        .await
        .unwrap();

    let oca_group = bracket.oca_group.clone().expect("advanced bracket has an OCA group");
    assert_eq!(bracket.take_profit_id, bracket.parent_id + 1);
    assert_eq!(bracket.stop_loss_id, bracket.parent_id + 2);

    // All three rows durable, children sharing the OCA group.
    let tp_before = stack.store.get_order(bracket.take_profit_id).unwrap().unwrap();
    let sl_before = stack.store.get_order(bracket.stop_loss_id).unwrap().unwrap();
    assert_eq!(tp_before.oca_group.as_deref(), Some(oca_group.as_str()));
    assert_eq!(sl_before.oca_group.as_deref(), Some(oca_group.as_str()));
    assert_eq!(tp_before.limit_price, Some(110.0));
    assert_eq!(sl_before.aux_price, Some(95.0));

    // Move the stop to 93 in place.
    let modified = stack
        .pipeline
        .modify_order(
            bracket.stop_loss_id,
            OrderChanges {
                aux_price: Some(93.0),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(modified.order_id, bracket.stop_loss_id);

    let tp_after = stack.store.get_order(bracket.take_profit_id).unwrap().unwrap();
    let sl_after = stack.store.get_order(bracket.stop_loss_id).unwrap().unwrap();
    // Same ids, same OCA group, take-profit untouched, stop moved.
    assert_eq!(tp_after.oca_group.as_deref(), Some(oca_group.as_str()));
    assert_eq!(sl_after.oca_group.as_deref(), Some(oca_group.as_str()));
    assert_eq!(tp_after.limit_price, Some(110.0));
    assert_eq!(sl_after.aux_price, Some(93.0));
    assert_eq!(sl_after.parent_order_id, Some(bracket.parent_id));

    // No extra orders were allocated by the modify.
    assert!(stack.store.get_order(bracket.stop_loss_id + 1).unwrap().is_none());
    stack.session.close();
}

#[tokio::test]
async fn modify_rejects_noop_and_unknown_orders() {
    let gateway = start_mock_gateway().await;
    let stack = build_stack(gateway.port).await;

    let result = stack
        .pipeline
        .place_order(OrderIntent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: "LMT".to_string(),
            quantity: 100.0,
            limit_price: Some(150.0),
            aux_price: None,
            trailing_percent: None,
            time_in_force: "DAY".to_string(),
            oca_type: None,
            discretionary_amount: None,
            evaluation_id: None,
            order_source: "test".to_string(),
        })
        .await
        .unwrap();

    // No field changes: rejected before any submit.
    let noop = stack
        .pipeline
        .modify_order(result.order_id, OrderChanges::default())
        .await;
    assert!(matches!(noop, Err(CoreError::Validation(_))));

    // Unknown order id: not in the gateway's open list.
    let unknown = stack
        .pipeline
        .modify_order(99_999, OrderChanges { quantity: Some(50.0), ..Default::default() })
        .await;
    assert!(matches!(unknown, Err(CoreError::Validation(_))));
    stack.session.close();
}

#[tokio::test]
async fn explicit_link_and_auto_outcome_on_close() {
    let gateway = start_mock_gateway().await;
    let stack = build_stack(gateway.port).await;

    stack
        .store
        .insert_evaluation(&evaluation("E1", "AAPL", 150.0, 148.0))
        .unwrap();

    let result = stack
        .pipeline
        .place_order(OrderIntent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: "MKT".to_string(),
            quantity: 100.0,
            limit_price: None,
            aux_price: None,
            trailing_percent: None,
            time_in_force: "DAY".to_string(),
            oca_type: None,
            discretionary_amount: None,
            evaluation_id: Some("E1".to_string()),
            order_source: "test".to_string(),
        })
        .await
        .unwrap();

    // Entry fill, exit fill, then the commissions that trigger the
    // close check.
    gateway.inject(fill("X1", result.order_id, "BOT", 100.0, 150.0));
    gateway.inject(fill("X2", result.order_id, "SLD", 100.0, 152.0));
    gateway.inject(GatewayEvent::CommissionReport {
        exec_id: "X1".to_string(),
        commission: 1.0,
        realized_pnl: None,
    });
    gateway.inject(GatewayEvent::CommissionReport {
        exec_id: "X2".to_string(),
        commission: 1.0,
        realized_pnl: Some(198.0),
    });

    // Debounce (50ms in tests) plus delivery time.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let execs = stack
        .store
        .get_executions_by_correlation(&result.correlation_id)
        .unwrap();
    assert_eq!(execs.len(), 2);
    assert!(execs.iter().all(|e| e.correlation_id == result.correlation_id));

    let links = stack.store.get_links_for_order(result.order_id).unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].link_type, LinkType::Explicit);
    assert_eq!(links[0].confidence, 1.0);
    assert_eq!(links[0].evaluation_id, "E1");

    let outcome = stack.store.get_outcome_for_eval("E1").unwrap().unwrap();
    assert!(outcome.trade_taken);
    assert_eq!(outcome.r_multiple, Some(1.0));
    assert_eq!(outcome.exit_reason.as_deref(), Some("auto_detected"));

    // A second close check is a no-op.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stack.store.get_recent_outcomes(10).unwrap().len(), 1);
    stack.session.close();
}

#[tokio::test]
async fn news_bulletins_stream_until_cancelled() {
    let gateway = start_mock_gateway().await;
    let stack = build_stack(gateway.port).await;

    let mut news = stack
        .session
        .subscribe_news(Duration::from_secs(1))
        .await
        .unwrap();

    gateway.inject(GatewayEvent::NewsBulletin {
        msg_id: 7,
        message: "trading halt".to_string(),
        origin_exchange: "NYSE".to_string(),
    });

    let bulletin = news.next().await.expect("bulletin should arrive");
    assert!(matches!(bulletin, GatewayEvent::NewsBulletin { msg_id: 7, .. }));

    drop(news);
    stack.session.close();
}

#[tokio::test]
async fn orders_fail_fast_when_gateway_is_down() {
    // Nothing listens on this port.
    let store = Arc::new(TradeStore::open_in_memory().unwrap());
    let broker = Arc::new(RequestBroker::new());
    let mut config = gateway_config(1);
    config.order_timeout_ms = 200;
    config.execution_timeout_ms = 200;
    let session = SessionManager::new(config.clone(), broker);
    tokio::spawn(Arc::clone(&session).run());

    let pipeline = OrderPipeline::new(Arc::clone(&session), store, config);
    let result = pipeline
        .place_order(OrderIntent {
            symbol: "AAPL".to_string(),
            side: OrderSide::Buy,
            order_type: "MKT".to_string(),
            quantity: 1.0,
            limit_price: None,
            aux_price: None,
            trailing_percent: None,
            time_in_force: "DAY".to_string(),
            oca_type: None,
            discretionary_amount: None,
            evaluation_id: None,
            order_source: "test".to_string(),
        })
        .await;
    assert!(matches!(result, Err(CoreError::SessionUnavailable(_))));
    session.close();
}
