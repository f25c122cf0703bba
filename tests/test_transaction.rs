//! Integration tests: MULTI/EXEC transactions.

mod common;

use respkit::{cmd, Adapter, RedisClient, RespError, RespValue, TxOutcome};
use common::*;

#[tokio::test]
async fn commit_applies_all_commands() {
    let (server, store) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();

    let tx = client.transaction();
    tx.queue(&cmd!("SET", "a", "1")).await.unwrap();
    tx.queue(&cmd!("INCRBY", "a", 41)).await.unwrap();
    tx.queue(&cmd!("GET", "a")).await.unwrap();
    let results = tx.exec().await.unwrap().into_results().unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[1].value, RespValue::Integer(42));
    assert_eq!(results[2].value, RespValue::Text("42".into()));
    assert_eq!(store.lock().get("a").map(|e| e.0.clone()), Some("42".into()));
}

#[tokio::test]
async fn watched_key_changed_by_another_client_aborts() {
    let (server, store) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();
    client.execute_value(&cmd!("SET", "balance", 100)).await.unwrap();

    let tx = client.transaction();
    tx.watch(["balance"]).await.unwrap();
    tx.queue(&cmd!("INCRBY", "balance", -30)).await.unwrap();

    // a second pooled connection writes the watched key
    client.execute_value(&cmd!("SET", "balance", 5)).await.unwrap();

    let outcome = tx.exec().await.unwrap();
    assert_eq!(outcome, TxOutcome::Aborted);
    assert_eq!(store.lock().get("balance").map(|e| e.0.clone()), Some("5".into()));
}

#[tokio::test]
async fn unwatched_change_still_commits() {
    let (server, _) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();

    let tx = client.transaction();
    tx.watch(["x"]).await.unwrap();
    tx.queue(&cmd!("INCR", "y")).await.unwrap();
    client.execute_value(&cmd!("SET", "z", 1)).await.unwrap();
    let results = tx.exec().await.unwrap().into_results().unwrap();
    assert_eq!(results[0].value, RespValue::Integer(1));
}

#[tokio::test]
async fn queue_time_error_aborts_with_execabort() {
    let (server, store) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();

    let tx = client.transaction();
    tx.queue(&cmd!("SET", "k", "v")).await.unwrap();
    tx.queue(&cmd!("BOGUS", "k")).await.unwrap();

    match tx.exec().await.unwrap_err() {
        RespError::Redis { message, .. } => assert!(message.starts_with("EXECABORT")),
        other => panic!("expected EXECABORT, got {other:?}"),
    }
    assert!(store.lock().get("k").is_none());

    // every queued reply was drained, so the connection is reused
    let pong: String = client.query(&cmd!("PING")).await.unwrap();
    assert_eq!(pong, "PONG");
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn runtime_error_stays_in_its_slot() {
    let (server, _) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();
    client.execute_value(&cmd!("SET", "s", "text")).await.unwrap();

    let tx = client.transaction();
    tx.queue(&cmd!("INCR", "s")).await.unwrap();
    tx.queue(&cmd!("INCR", "t")).await.unwrap();
    let results = tx.exec().await.unwrap().into_results().unwrap();
    assert!(results[0].is_error());
    assert_eq!(results[1].value, RespValue::Integer(1));
}

#[tokio::test]
async fn discard_drops_queued_commands() {
    let (server, store) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();

    let tx = client.transaction();
    tx.queue(&cmd!("SET", "gone", 1)).await.unwrap();
    tx.discard().await.unwrap();
    assert!(store.lock().get("gone").is_none());
    // nothing reached the server
    assert_eq!(server.count("MULTI"), 0);
    assert_eq!(server.count("DISCARD"), 0);

    let pong: String = client.query(&cmd!("PING")).await.unwrap();
    assert_eq!(pong, "PONG");
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn single_client_transaction() {
    let (server, _) = kv_server().await;
    let client = RedisClient::single(server.config());

    let tx = client.transaction();
    tx.queue(&cmd!("SET", "a", 1)).await.unwrap();
    tx.queue(&cmd!("INCR", "a")).await.unwrap();
    let results = tx.exec().await.unwrap().into_results().unwrap();
    assert_eq!(results[1].value, RespValue::Integer(2));
    drop(tx);

    let v: i64 = client.query(&cmd!("GET", "a")).await.unwrap();
    assert_eq!(v, 2);
}

#[tokio::test]
async fn batch_is_sent_in_one_write() {
    let (server, _) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();

    let tx = client.transaction();
    tx.queue(&cmd!("SET", "a", 1)).await.unwrap();
    tx.queue(&cmd!("INCR", "a")).await.unwrap();
    assert_eq!(tx.len().await, 2);
    assert_eq!(server.count("MULTI"), 0);
    tx.exec().await.unwrap();

    let names: Vec<String> = server.requests().into_iter().map(|r| r[0].clone()).collect();
    let start = names.iter().position(|n| n == "MULTI").unwrap();
    assert_eq!(&names[start..], ["MULTI", "SET", "INCR", "EXEC"]);
}

#[tokio::test]
async fn cancelled_exec_does_not_poison_the_pool() {
    init_tracing();
    let (server, store) = kv_server().await;
    let client = RedisClient::connect(server.config()).await.unwrap();

    let tx = client.transaction();
    tx.queue(&cmd!("SLEEP")).await.unwrap();
    let res = tokio::time::timeout(std::time::Duration::from_millis(50), tx.exec()).await;
    assert!(res.is_err());
    drop(tx);

    client.execute_value(&cmd!("SET", "after", "x")).await.unwrap();
    let v: String = client.query(&cmd!("GET", "after")).await.unwrap();
    assert_eq!(v, "x");
    assert_eq!(store.lock().get("after").map(|e| e.0.clone()), Some("x".into()));
    assert_eq!(server.connections(), 2);
}
