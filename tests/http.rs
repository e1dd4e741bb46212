mod common;

use common::{eventually, setup};
use raftnode::client::{ClientError, HttpClient};
use raftnode::rpc::{ExecuteResult, HttpConfig, HttpRPC, RequestVoteRequest, RPC};
use raftnode::storage::MemoryStorage;
use raftnode::{Config, ProtocolState};
use std::net::TcpListener;
use std::time::{Duration, Instant};

/// Distinct ports that were free a moment ago.
fn free_addresses(count: usize) -> Vec<String> {
    let listeners: Vec<TcpListener> = (0..count)
        .map(|_| TcpListener::bind("127.0.0.1:0").unwrap())
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().unwrap().to_string())
        .collect()
}

fn http_config(address: &str, peers: &[String]) -> Config {
    let mut config = common::test_config(address, &[]);
    config.peers = peers.to_vec();
    config
}

async fn wait_for_leader(client: &HttpClient, addresses: &[String]) -> String {
    eventually(move || async move {
        for address in addresses {
            if let Ok(status) = client.status(address).await {
                if status.role == ProtocolState::Leader {
                    return Some(address.clone());
                }
            }
        }
        None
    })
    .await
}

#[tokio::test]
async fn single_node_over_http() {
    setup();
    let address = free_addresses(1).remove(0);
    let running = raftnode::start(
        http_config(&address, &[]),
        MemoryStorage::new(),
        &HttpConfig::default(),
    )
    .unwrap();

    let mut client = HttpClient::new(address.clone(), 20);
    wait_for_leader(&client, &[address.clone()]).await;

    assert_eq!(
        client.set("foo", "bar").await.unwrap(),
        ExecuteResult::Text("OK".to_string())
    );
    assert_eq!(
        client.get("foo").await.unwrap(),
        ExecuteResult::Text("bar".to_string())
    );
    client.execute("append", "foo", Some("baz")).await.unwrap();
    assert_eq!(
        client.execute("strlen", "foo", None).await.unwrap(),
        ExecuteResult::Length(6)
    );

    match client.execute("incr", "foo", None).await {
        Err(ClientError::Status { status: 400, body }) => {
            assert!(body.unwrap().error.contains("incr"))
        }
        other => panic!("invalid command was accepted: {:?}", other),
    }

    client.set_heartbeat_visibility(&address, true).await.unwrap();
    let status = client.status(&address).await.unwrap();
    assert_eq!(status.store.get("foo").map(String::as_str), Some("barbaz"));
    assert_eq!(status.self_address, address);

    client.shutdown(&address).await.unwrap();
    running.wait().await.unwrap();
    assert!(client.status(&address).await.is_err());
}

#[tokio::test]
async fn client_follows_redirects() {
    setup();
    let addresses = free_addresses(2);
    let nodes: Vec<_> = addresses
        .iter()
        .map(|address| {
            let peers: Vec<String> = addresses
                .iter()
                .filter(|peer| *peer != address)
                .cloned()
                .collect();
            raftnode::start(
                http_config(address, &peers),
                MemoryStorage::new(),
                &HttpConfig::default(),
            )
            .unwrap()
        })
        .collect();

    let probe = HttpClient::new(addresses[0].clone(), 1);
    let leader = wait_for_leader(&probe, &addresses).await;
    let follower = addresses
        .iter()
        .find(|address| **address != leader)
        .cloned()
        .unwrap();
    eventually(|| {
        let probe = &probe;
        let follower = follower.clone();
        let leader = leader.clone();
        async move {
            let status = probe.status(&follower).await.ok()?;
            (status.leader_address == Some(leader)).then_some(())
        }
    })
    .await;

    let mut client = HttpClient::new(follower.clone(), 20);
    assert_eq!(
        client.set("foo", "bar").await.unwrap(),
        ExecuteResult::Text("OK".to_string())
    );
    assert_eq!(client.leader_address(), leader);

    for (address, node) in addresses.iter().zip(nodes) {
        client.shutdown(address).await.unwrap();
        node.wait().await.unwrap();
    }
}

#[tokio::test]
async fn unresponsive_peer_times_out() {
    setup();
    // Connections complete in the backlog, but nothing ever reads or answers them.
    let silent = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = silent.local_addr().unwrap().to_string();
    let rpc = HttpRPC::with_timeout(Duration::from_millis(100));

    let request = RequestVoteRequest {
        term: 1,
        candidate_id: "a:1".to_string(),
        candidate_address: "a:1".to_string(),
        last_log_index: 1,
        last_log_term: 0,
    };
    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        rpc.request_vote(address.clone(), request),
    )
    .await
    .expect("request was never given up on");
    let error = result.unwrap_err();
    assert!(error.to_string().contains("timed out"), "{}", error);
    assert!(started.elapsed() < Duration::from_secs(2));
    drop(silent);
}
