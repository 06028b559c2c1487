//! Single-connection behaviour against a scripted server.

mod support;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redlink::{
    Client, Commander, ReconnectDecision, RedisConfig, RedisError, Reply, Status,
};
use support::{handshake_reply, message_frame, spawn_server, sub_confirmation, Action};

fn test_config(addr: std::net::SocketAddr) -> RedisConfig {
    let mut config = RedisConfig::new(addr.ip().to_string(), addr.port());
    config.retry_strategy = Arc::new(|_| Some(Duration::from_millis(10)));
    config
}

#[tokio::test]
async fn set_then_get_roundtrip() {
    let store: Arc<Mutex<HashMap<String, String>>> = Arc::default();
    let server_store = store.clone();
    let (addr, _server) = spawn_server(move |_, name, args| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match name {
            "set" => {
                server_store
                    .lock()
                    .unwrap()
                    .insert(args[0].clone(), args[1].clone());
                Action::Reply(Reply::Simple("OK".to_string()))
            }
            "get" => match server_store.lock().unwrap().get(&args[0]) {
                Some(value) => Action::Reply(Reply::bulk(value.clone())),
                None => Action::Reply(Reply::Null),
            },
            _ => Action::Reply(Reply::Error(format!("ERR unknown command '{name}'"))),
        }
    })
    .await;

    let client = Client::connect(test_config(addr)).await.unwrap();
    assert_eq!(client.status(), Status::Ready);
    client.set("foo", "bar").await.unwrap();
    assert_eq!(client.get("foo").await.unwrap().as_deref(), Some("bar"));
    assert_eq!(client.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn replies_bind_in_submission_order() {
    let (addr, _server) = spawn_server(move |_, name, args| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        // Echo the argument so each reply is distinguishable.
        Action::Reply(Reply::bulk(args[0].clone()))
    })
    .await;

    let client = Client::connect(test_config(addr)).await.unwrap();
    let (a, b, c) = tokio::join!(
        client.call("echo", vec![bytes::Bytes::from_static(b"one")]),
        client.call("echo", vec![bytes::Bytes::from_static(b"two")]),
        client.call("echo", vec![bytes::Bytes::from_static(b"three")]),
    );
    assert_eq!(a.unwrap(), Reply::bulk("one"));
    assert_eq!(b.unwrap(), Reply::bulk("two"));
    assert_eq!(c.unwrap(), Reply::bulk("three"));
}

#[tokio::test]
async fn pipeline_counts_in_order() {
    let counter = Arc::new(Mutex::new(0i64));
    let server_counter = counter.clone();
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match name {
            "incr" => {
                let mut value = server_counter.lock().unwrap();
                *value += 1;
                Action::Reply(Reply::Integer(*value))
            }
            _ => Action::Reply(Reply::Error("ERR unexpected".to_string())),
        }
    })
    .await;

    let client = Arc::new(Client::connect(test_config(addr)).await.unwrap());
    let mut pipeline = client.pipeline();
    pipeline.incr("c").incr("c").incr("c");
    let results = pipeline.exec().await.unwrap();
    let values: Vec<i64> = results
        .into_iter()
        .map(|r| r.unwrap().as_int().unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[tokio::test]
async fn transaction_wraps_multi_exec() {
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match name {
            "multi" => Action::Reply(Reply::Simple("OK".to_string())),
            "set" | "incr" => Action::Reply(Reply::Simple("QUEUED".to_string())),
            "exec" => Action::Reply(Reply::Array(vec![
                Reply::Simple("OK".to_string()),
                Reply::Integer(2),
            ])),
            _ => Action::Reply(Reply::Error("ERR unexpected".to_string())),
        }
    })
    .await;

    let client = Arc::new(Client::connect(test_config(addr)).await.unwrap());
    let mut tx = client.multi();
    tx.set("k", "1").incr("k");
    let results = tx.exec().await.unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(
        results[0].as_ref().unwrap(),
        &Reply::Simple("OK".to_string())
    );
    assert_eq!(
        results[1].as_ref().unwrap(),
        &Reply::Simple("QUEUED".to_string())
    );
    assert_eq!(
        results[2].as_ref().unwrap(),
        &Reply::Simple("QUEUED".to_string())
    );
    assert_eq!(
        results[3].as_ref().unwrap(),
        &Reply::Array(vec![Reply::Simple("OK".to_string()), Reply::Integer(2)])
    );
}

#[tokio::test]
async fn stringify_numbers_beyond_double_precision() {
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        Action::Reply(Reply::Integer(9_007_199_254_740_993))
    })
    .await;

    let mut config = test_config(addr);
    config.stringify_numbers = true;
    let client = Client::connect(config).await.unwrap();
    let reply = client.call("incr", vec![bytes::Bytes::from_static(b"k")]).await;
    assert_eq!(reply.unwrap(), Reply::bulk("9007199254740993"));
}

#[tokio::test]
async fn subscriber_mode_rejects_other_commands_off_the_wire() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let server_seen = seen.clone();
    let (addr, _server) = spawn_server(move |_, name, args| {
        server_seen.lock().unwrap().push(name.to_string());
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match name {
            "subscribe" => Action::Reply(sub_confirmation("subscribe", &args[0], 1)),
            "ping" => Action::Reply(Reply::Simple("PONG".to_string())),
            _ => Action::Reply(Reply::Error("ERR unexpected".to_string())),
        }
    })
    .await;

    let client = Client::connect(test_config(addr)).await.unwrap();
    client.subscribe(&["ch1"]).await.unwrap();

    // Disallowed commands fail client-side.
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, RedisError::SubscriberMode), "got {err:?}");
    assert!(!seen.lock().unwrap().iter().any(|n| n == "get"));

    // The allowed set still flows.
    assert_eq!(client.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn published_messages_reach_the_listener() {
    let (addr, _server) = spawn_server(move |_, name, args| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match name {
            "subscribe" => Action::Replies(vec![
                sub_confirmation("subscribe", &args[0], 1),
                message_frame(&args[0], "hello"),
            ]),
            _ => Action::Reply(Reply::Error("ERR unexpected".to_string())),
        }
    })
    .await;

    let client = Client::connect(test_config(addr)).await.unwrap();
    let mut messages = client.messages().unwrap();
    client.subscribe(&["ch1"]).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), messages.recv())
        .await
        .expect("message within a second")
        .expect("stream open");
    assert_eq!(message.channel, "ch1");
    assert_eq!(message.payload.as_ref(), b"hello");
}

#[tokio::test]
async fn resubscribes_after_connection_loss() {
    let log: Arc<Mutex<Vec<(usize, String)>>> = Arc::default();
    let server_log = log.clone();
    let (addr, _server) = spawn_server(move |conn, name, args| {
        server_log.lock().unwrap().push((conn, name.to_string()));
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match (conn, name) {
            // First connection: confirm, then push a message and die.
            (0, "subscribe") => Action::RepliesThenClose(vec![sub_confirmation(
                "subscribe",
                &args[0],
                1,
            )]),
            // Reconnect: confirm the replayed subscription and deliver.
            (_, "subscribe") => Action::Replies(vec![
                sub_confirmation("subscribe", &args[0], 1),
                message_frame(&args[0], "after-reconnect"),
            ]),
            _ => Action::Reply(Reply::Error("ERR unexpected".to_string())),
        }
    })
    .await;

    let client = Client::connect(test_config(addr)).await.unwrap();
    let mut messages = client.messages().unwrap();
    client.subscribe(&["ch1"]).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), messages.recv())
        .await
        .expect("message after reconnect")
        .expect("stream open");
    assert_eq!(message.payload.as_ref(), b"after-reconnect");

    // The second connection replayed SUBSCRIBE without caller help.
    let log = log.lock().unwrap();
    assert!(log
        .iter()
        .any(|(conn, name)| *conn >= 1 && name == "subscribe"));
}

#[tokio::test]
async fn lazy_connect_flushes_offline_queue_on_demand() {
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        Action::Reply(Reply::Simple("PONG".to_string()))
    })
    .await;

    let mut config = test_config(addr);
    config.lazy_connect = true;
    let client = Client::new(config).unwrap();
    tokio::task::yield_now().await;
    assert_eq!(client.status(), Status::Wait);

    // The first command leaves `wait`, connects, and replays the queue.
    assert_eq!(client.ping().await.unwrap(), "PONG");
    assert_eq!(client.status(), Status::Ready);
}

#[tokio::test]
async fn manual_disconnect_ends_and_connect_restarts() {
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        Action::Reply(Reply::Simple("PONG".to_string()))
    })
    .await;

    let client = Client::connect(test_config(addr)).await.unwrap();
    assert_eq!(client.ping().await.unwrap(), "PONG");

    client.disconnect(false);
    tokio::time::timeout(Duration::from_secs(1), async {
        while client.status() != Status::End {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("reaches end");

    // Submissions are refused at `end`...
    let err = client.ping().await.unwrap_err();
    assert!(matches!(err, RedisError::ConnectionClosed), "got {err:?}");

    // ...until an explicit connect restarts the lifecycle.
    client.reconnect();
    tokio::time::timeout(Duration::from_secs(1), async {
        while client.status() != Status::Ready {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("ready again");
    assert_eq!(client.ping().await.unwrap(), "PONG");
}

#[tokio::test]
async fn reconnect_on_error_resends_the_command() {
    let attempts: Arc<Mutex<usize>> = Arc::default();
    let server_attempts = attempts.clone();
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        let mut n = server_attempts.lock().unwrap();
        *n += 1;
        if *n == 1 {
            Action::Reply(Reply::Error(
                "READONLY You can't write against a read only replica.".to_string(),
            ))
        } else {
            Action::Reply(Reply::Simple("OK".to_string()))
        }
    })
    .await;

    let mut config = test_config(addr);
    config.reconnect_on_error = Some(Arc::new(|err| {
        if err.message.starts_with("READONLY") {
            ReconnectDecision::ReconnectAndResend
        } else {
            ReconnectDecision::No
        }
    }));
    let client = Client::connect(config).await.unwrap();
    // The first attempt hits the READONLY reply; the hook reconnects and
    // resends, and the caller only ever sees the final OK.
    client.set("k", "v").await.unwrap();
    assert_eq!(*attempts.lock().unwrap(), 2);
}

#[tokio::test]
async fn in_flight_commands_fail_on_stream_end() {
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match name {
            "get" => Action::Close,
            _ => Action::Reply(Reply::Simple("OK".to_string())),
        }
    })
    .await;

    let mut config = test_config(addr);
    config.auto_resend_unfulfilled_commands = false;
    config.retry_strategy = Arc::new(|_| None);
    let client = Client::connect(config).await.unwrap();
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, RedisError::ConnectionClosed), "got {err:?}");
}

#[tokio::test]
async fn monitor_mode_streams_server_lines() {
    let (addr, _server) = spawn_server(move |_, name, _| {
        if let Some(reply) = handshake_reply(name) {
            return Action::Reply(reply);
        }
        match name {
            "monitor" => Action::Replies(vec![
                Reply::Simple("OK".to_string()),
                Reply::Simple(r#"1700000000.000000 [0 127.0.0.1:50000] "GET" "k""#.to_string()),
            ]),
            _ => Action::Reply(Reply::Error("ERR unexpected".to_string())),
        }
    })
    .await;

    let client = Client::connect(test_config(addr)).await.unwrap();
    let mut lines = client.monitor().await.unwrap();
    assert_eq!(client.status(), Status::Monitoring);

    let line = tokio::time::timeout(Duration::from_secs(1), lines.recv())
        .await
        .expect("monitor line")
        .expect("stream open");
    assert!(line.contains("\"GET\""));

    // Ordinary commands are rejected while monitoring.
    let err = client.get("k").await.unwrap_err();
    assert!(matches!(err, RedisError::MonitorMode), "got {err:?}");
}
