use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

use bitfinex_ws_client::{
    AuthArgs, BitfinexError, ChannelKind, Manager, ManagerConfig, OrderPayload, PoolEvent,
};
use rust_decimal::Decimal;

type Ws = WebSocketStream<TcpStream>;

/// Start a loopback server running `handler` for every accepted socket.
async fn start_server<H>(handler: H) -> String
where
    H: Fn(Ws) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            if let Ok(ws) = accept_async(stream).await {
                tokio::spawn(handler(ws));
            }
        }
    });

    format!("ws://{addr}")
}

async fn send_json(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn recv_json(ws: &mut Ws) -> Option<Value> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            _ => {}
        }
    }
    None
}

async fn send_info(ws: &mut Ws) {
    send_json(
        ws,
        json!({"event": "info", "version": 2, "platform": {"status": 1}}),
    )
    .await;
}

/// A small market simulator: confirms subscriptions, answers auth, ping and
/// conf, and acknowledges order commands with success notifications.
async fn market_session(mut ws: Ws, conf_log: Option<mpsc::UnboundedSender<u64>>) {
    send_info(&mut ws).await;
    let mut next_chan = 10u64;

    while let Some(frame) = recv_json(&mut ws).await {
        if let Some(event) = frame.get("event").and_then(Value::as_str) {
            match event {
                "subscribe" => {
                    let mut reply = frame.clone();
                    reply["event"] = json!("subscribed");
                    reply["chanId"] = json!(next_chan);
                    next_chan += 1;
                    send_json(&mut ws, reply).await;
                }
                "unsubscribe" => {
                    let mut reply = frame.clone();
                    reply["event"] = json!("unsubscribed");
                    reply["status"] = json!("OK");
                    send_json(&mut ws, reply).await;
                }
                "auth" => {
                    send_json(
                        &mut ws,
                        json!({"event": "auth", "status": "OK", "chanId": 0, "userId": 42}),
                    )
                    .await;
                }
                "ping" => {
                    send_json(
                        &mut ws,
                        json!({"event": "pong", "cid": frame["cid"], "ts": 1574694478000u64}),
                    )
                    .await;
                }
                "conf" => {
                    let flags = frame.get("flags").and_then(Value::as_u64).unwrap_or(0);
                    if let Some(log) = &conf_log {
                        let _ = log.send(flags);
                    }
                    send_json(
                        &mut ws,
                        json!({"event": "conf", "status": "OK", "flags": flags}),
                    )
                    .await;
                }
                _ => {}
            }
        } else if let Some(elements) = frame.as_array() {
            // Order envelope: [0, op, null, payload].
            let op = elements.get(1).and_then(Value::as_str).unwrap_or_default();
            let payload = elements.get(3).cloned().unwrap_or(Value::Null);
            let notification = match op {
                "on" => {
                    let cid = payload["cid"].clone();
                    Some(json!([
                        1574694478000u64, "on-req", null, null,
                        [1234, null, cid, "tBTCUSD"], null, "SUCCESS", "Submitting order"
                    ]))
                }
                "ou" => {
                    let id = payload["id"].clone();
                    Some(json!([
                        1574694478000u64, "ou-req", null, null,
                        [id, null, 777], null, "SUCCESS", "Updating order"
                    ]))
                }
                "oc" => {
                    let id = payload["id"].clone();
                    Some(json!([
                        1574694478000u64, "oc-req", null, null,
                        [id, null, 777], null, "SUCCESS", "Cancelling order"
                    ]))
                }
                "oc_multi" => {
                    let gid = payload["gid"][0].clone();
                    Some(json!([
                        1574694478000u64, "oc_multi-req", null, null,
                        [[null, gid]], null, "SUCCESS", "Cancelling orders"
                    ]))
                }
                _ => None,
            };
            if let Some(notification) = notification {
                send_json(&mut ws, json!([0, "n", notification])).await;
            }
        }
    }
}

async fn market_server() -> String {
    start_server(|ws| Box::pin(market_session(ws, None))).await
}

fn manager_for(url: &str) -> Manager {
    Manager::new(ManagerConfig::builder().ws_url(url).build())
}

/// Await the first broadcast event matching `predicate`.
async fn wait_for(
    events: &mut broadcast::Receiver<PoolEvent>,
    predicate: impl Fn(&PoolEvent) -> bool,
) -> PoolEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return event,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn test_subscribe_confirms_and_delivers_trades() {
    let url = start_server(|ws| {
        Box::pin(async move {
            let mut ws = ws;
            send_info(&mut ws).await;

            let subscribe = recv_json(&mut ws).await.unwrap();
            assert_eq!(subscribe["event"], json!("subscribe"));
            assert_eq!(subscribe["channel"], json!("trades"));
            send_json(
                &mut ws,
                json!({
                    "event": "subscribed",
                    "channel": "trades",
                    "chanId": 17,
                    "symbol": "tBTCUSD",
                    "pair": "BTCUSD",
                }),
            )
            .await;

            // A heartbeat, then a snapshot.
            send_json(&mut ws, json!([17, "hb"])).await;
            send_json(
                &mut ws,
                json!([17, [[401597393, 1574694478000u64, 0.005, 7245.3]]]),
            )
            .await;

            // Keep the socket open until the client closes it.
            while recv_json(&mut ws).await.is_some() {}
        })
    })
    .await;

    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionOpened { .. })
    })
    .await;

    manager.subscribe_trades("tBTCUSD").await.unwrap();
    let subscribed = wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Subscribed { chan_id: 17, .. })
    })
    .await;
    let PoolEvent::Subscribed { channel, .. } = subscribed else {
        unreachable!();
    };
    assert_eq!(channel.kind(), ChannelKind::Trades);
    assert_eq!(channel.symbol(), Some("tBTCUSD"));

    // The heartbeat never surfaces as data; the snapshot does.
    let data = wait_for(&mut events, |e| matches!(e, PoolEvent::Data { .. })).await;
    let PoolEvent::Data { event, .. } = data else {
        unreachable!();
    };
    assert_eq!(event.kind, ChannelKind::Trades);
    assert_eq!(event.requested[0][0], json!(401597393));

    // Pending list is reconciled.
    let snapshots = manager.connections().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert!(snapshots[0].pending_subscriptions.is_empty());
    assert!(snapshots[0].channels.contains_key(&17));

    manager.close().await.unwrap();
}

#[tokio::test]
async fn test_filtered_stream_selects_one_symbol() {
    // Confirms both subscriptions, then pushes a trade on each channel,
    // the unrelated symbol first.
    let url = start_server(|ws| {
        Box::pin(async move {
            let mut ws = ws;
            send_info(&mut ws).await;

            let mut confirmed = 0u64;
            while let Some(frame) = recv_json(&mut ws).await {
                if frame.get("event").and_then(Value::as_str) != Some("subscribe") {
                    continue;
                }
                let chan_id = if frame["symbol"] == json!("tBTCUSD") { 17 } else { 18 };
                let mut reply = frame.clone();
                reply["event"] = json!("subscribed");
                reply["chanId"] = json!(chan_id);
                send_json(&mut ws, reply).await;

                confirmed += 1;
                if confirmed == 2 {
                    send_json(&mut ws, json!([18, [[1, 1574694478000u64, 1.0, 160.5]]])).await;
                    send_json(&mut ws, json!([17, [[2, 1574694479000u64, 0.5, 7245.3]]])).await;
                }
            }
        })
    })
    .await;

    let manager = manager_for(&url);
    let mut btc_trades = manager.trades("tBTCUSD");

    manager.subscribe_trades("tBTCUSD").await.unwrap();
    manager.subscribe_trades("tETHUSD").await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), btc_trades.next())
        .await
        .expect("timed out waiting for trade")
        .unwrap();

    // The tETHUSD trade arrived first but never surfaces on this stream.
    assert_eq!(event.kind, ChannelKind::Trades);
    assert_eq!(event.chan_filter["symbol"], json!("tBTCUSD"));
    assert_eq!(event.requested[0][0], json!(2));
}

#[tokio::test]
async fn test_order_submit_resolves_on_notification() {
    let url = market_server().await;
    let manager = Manager::new(
        ManagerConfig::builder()
            .ws_url(&url)
            .auth(AuthArgs::from_key_secret("api key", "api secret"))
            .build(),
    );
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| matches!(e, PoolEvent::AuthSuccess { .. })).await;

    let order = OrderPayload::new("EXCHANGE LIMIT", "tBTCUSD", Decimal::new(5, 3))
        .with_cid(42)
        .with_price(Decimal::new(72453, 1));
    let confirmed = manager.submit_order(order).await.unwrap();

    // The resolution value is the notification's inner payload; cid at
    // position 2.
    assert_eq!(confirmed[2], json!(42));
}

#[tokio::test]
async fn test_order_commands_correlate_by_id() {
    let url = market_server().await;
    let manager = Manager::new(
        ManagerConfig::builder()
            .ws_url(&url)
            .auth(AuthArgs::from_key_secret("api key", "api secret"))
            .build(),
    );
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| matches!(e, PoolEvent::AuthSuccess { .. })).await;

    let updated = manager
        .update_order(json!({"id": 1234, "price": "7300"}))
        .await
        .unwrap();
    assert_eq!(updated[0], json!(1234));

    let cancelled = manager.cancel_order(1234u64).await.unwrap();
    assert_eq!(cancelled[0], json!(1234));

    let group = manager.cancel_orders_by_gid(9).await.unwrap();
    assert_eq!(group[0][1], json!(9));
}

#[tokio::test]
async fn test_order_rejection_surfaces_error() {
    let url = start_server(|ws| {
        Box::pin(async move {
            let mut ws = ws;
            send_info(&mut ws).await;

            while let Some(frame) = recv_json(&mut ws).await {
                if frame.get("event").and_then(Value::as_str) == Some("auth") {
                    send_json(
                        &mut ws,
                        json!({"event": "auth", "status": "OK", "chanId": 0}),
                    )
                    .await;
                } else if frame.is_array() {
                    send_json(
                        &mut ws,
                        json!([0, "n", [
                            1574694478000u64, "oc-req", null, null,
                            [1234], null, "ERROR", "Order not found."
                        ]]),
                    )
                    .await;
                }
            }
        })
    })
    .await;

    let manager = Manager::new(
        ManagerConfig::builder()
            .ws_url(&url)
            .auth(AuthArgs::from_token("test token"))
            .build(),
    );
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| matches!(e, PoolEvent::AuthSuccess { .. })).await;

    let result = manager.cancel_order(1234u64).await;
    match result {
        Err(BitfinexError::RequestFailed { status, message }) => {
            assert_eq!(status, "ERROR");
            assert_eq!(message, "Order not found.");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn test_delayed_order_commands_pace_submission() {
    let url = market_server().await;
    let manager = Manager::new(
        ManagerConfig::builder()
            .ws_url(&url)
            .auth(AuthArgs::from_key_secret("api key", "api secret"))
            .build(),
    );
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| matches!(e, PoolEvent::AuthSuccess { .. })).await;

    let delay = Duration::from_millis(150);
    let order = OrderPayload::new("EXCHANGE LIMIT", "tBTCUSD", Decimal::new(5, 3)).with_cid(91);

    let started = tokio::time::Instant::now();
    let confirmed = manager.submit_order_with_delay(delay, order).await.unwrap();
    assert!(started.elapsed() >= delay);
    assert_eq!(confirmed[2], json!(91));

    let started = tokio::time::Instant::now();
    let cancelled = manager.cancel_order_with_delay(delay, 1234u64).await.unwrap();
    assert!(started.elapsed() >= delay);
    assert_eq!(cancelled[0], json!(1234));
}

#[tokio::test]
async fn test_order_without_authenticated_connection_fails() {
    let url = market_server().await;
    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionOpened { .. })
    })
    .await;

    let order = OrderPayload::new("EXCHANGE MARKET", "tBTCUSD", Decimal::ONE);
    assert!(matches!(
        manager.submit_order(order).await,
        Err(BitfinexError::Auth(_))
    ));
}

#[tokio::test]
async fn test_ping_resolves_on_matching_pong() {
    let url = market_server().await;
    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionOpened { .. })
    })
    .await;

    let pong = manager.ping().await.unwrap();
    assert_eq!(pong["event"], json!("pong"));
    assert!(pong["cid"].is_u64());
}

#[tokio::test]
async fn test_authenticate_connection_awaits_handshake() {
    let url = market_server().await;
    let manager = Manager::new(ManagerConfig::builder().ws_url(&url).build());
    let mut events = manager.events();

    let id = manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionOpened { .. })
    })
    .await;

    manager
        .update_auth_args(AuthArgs::from_token("test token"))
        .await
        .unwrap();
    let event = manager.authenticate_connection(id).await.unwrap();
    assert_eq!(event["status"], json!("OK"));

    let snapshot = manager.connection(id).await.unwrap();
    assert!(snapshot.authenticated);
    assert_eq!(
        snapshot.channels.get(&0).map(|c| c.kind()),
        Some(ChannelKind::Auth)
    );
}

#[tokio::test]
async fn test_channel_limit_spills_to_second_socket() {
    let url = market_server().await;
    let manager = Manager::new(
        ManagerConfig::builder()
            .ws_url(&url)
            .channels_per_socket(1)
            .build(),
    );
    let mut events = manager.events();

    // First subscribe opens a connection; the second finds it full and
    // spills onto a fresh socket.
    manager.subscribe_trades("tBTCUSD").await.unwrap();
    manager.subscribe_trades("tETHUSD").await.unwrap();

    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Subscribed { channel, .. } if channel.symbol() == Some("tBTCUSD"))
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Subscribed { channel, .. } if channel.symbol() == Some("tETHUSD"))
    })
    .await;

    assert_eq!(manager.connection_count().await.unwrap(), 2);

    let snapshots = manager.connections().await.unwrap();
    assert!(snapshots.iter().all(|s| s.data_channel_count() == 1));
}

#[tokio::test]
async fn test_unsubscribe_by_predicate() {
    let url = market_server().await;
    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.subscribe_trades("tBTCUSD").await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Subscribed { .. })
    })
    .await;

    let matched = manager
        .unsubscribe_where(|c| c.symbol() == Some("tBTCUSD"))
        .await
        .unwrap();
    assert!(matched);

    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Unsubscribed { .. })
    })
    .await;

    let snapshots = manager.connections().await.unwrap();
    assert_eq!(snapshots[0].data_channel_count(), 0);

    // No channel left to match.
    let matched = manager
        .unsubscribe_where(|c| c.symbol() == Some("tBTCUSD"))
        .await
        .unwrap();
    assert!(!matched);
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let url = market_server().await;
    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.subscribe_trades("tBTCUSD").await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Subscribed { .. })
    })
    .await;

    manager.reconnect_all().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionReopened { .. })
    })
    .await;

    // The subscription is replayed on the replacement transport.
    let subscribed = wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Subscribed { .. })
    })
    .await;
    let PoolEvent::Subscribed { channel, .. } = subscribed else {
        unreachable!();
    };
    assert_eq!(channel.symbol(), Some("tBTCUSD"));

    // Still one logical connection.
    assert_eq!(manager.connection_count().await.unwrap(), 1);
    let snapshots = manager.connections().await.unwrap();
    assert_eq!(snapshots[0].data_channel_count(), 1);
}

#[tokio::test]
async fn test_flag_commands_mirror_across_pool() {
    let (conf_tx, mut conf_rx) = mpsc::unbounded_channel();
    let url = start_server(move |ws| {
        let log = conf_tx.clone();
        Box::pin(market_session(ws, Some(log)))
    })
    .await;

    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionOpened { .. })
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionOpened { .. })
    })
    .await;

    manager.enable_flag(131072).await.unwrap();

    // Both sockets receive the conf command.
    for _ in 0..2 {
        let flags = tokio::time::timeout(Duration::from_secs(5), conf_rx.recv())
            .await
            .expect("timed out waiting for conf")
            .unwrap();
        assert_eq!(flags, 131072);
    }

    // Exactly one FlagsSet for the command, one FlagsUpdated per
    // acknowledgement; the second socket's mirror stays silent.
    let mut flags_set = 0;
    let mut flags_updated = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while flags_updated < 2 {
            match events.recv().await {
                Ok(PoolEvent::FlagsSet { flags: 131072, .. }) => flags_set += 1,
                Ok(PoolEvent::FlagsUpdated { flags: 131072, .. }) => flags_updated += 1,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for flag events");
    assert_eq!(flags_set, 1);

    let snapshots = manager.connections().await.unwrap();
    assert!(snapshots.iter().all(|s| s.is_flag_enabled(131072)));
}

#[tokio::test]
async fn test_version_mismatch_is_fatal() {
    let url = start_server(|ws| {
        Box::pin(async move {
            let mut ws = ws;
            send_json(&mut ws, json!({"event": "info", "version": 1})).await;
            while recv_json(&mut ws).await.is_some() {}
        })
    })
    .await;

    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.open_connection().await.unwrap();

    let error = wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ProtocolError { .. })
    })
    .await;
    let PoolEvent::ProtocolError { error, .. } = error else {
        unreachable!();
    };
    assert!(error.message.contains("v1"), "error names the bad version");
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionClosed { .. })
    })
    .await;

    assert_eq!(manager.connection_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unexpected_drop_removes_connection() {
    let url = start_server(|ws| {
        Box::pin(async move {
            let mut ws = ws;
            send_info(&mut ws).await;
            // Drop the socket without a close handshake.
        })
    })
    .await;

    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionOpened { .. })
    })
    .await;
    wait_for(&mut events, |e| {
        matches!(e, PoolEvent::ConnectionClosed { .. })
    })
    .await;

    assert_eq!(manager.connection_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_commands_before_open_are_buffered() {
    let url = market_server().await;
    let manager = manager_for(&url);
    let mut events = manager.events();

    manager.open_connection().await.unwrap();
    manager.subscribe_trades("tBTCUSD").await.unwrap();

    // The subscribe is delivered once the socket opens.
    let subscribed = wait_for(&mut events, |e| {
        matches!(e, PoolEvent::Subscribed { .. })
    })
    .await;
    let PoolEvent::Subscribed { channel, .. } = subscribed else {
        unreachable!();
    };
    assert_eq!(channel.symbol(), Some("tBTCUSD"));
}
