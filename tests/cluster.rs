mod common;

use common::{
    agreed_leader, eventually, setup, start_cluster, statuses, test_config, LocalNetwork,
};
use raftnode::rpc::{ExecuteRequest, ExecuteResponse, RaftServer};
use raftnode::storage::MemoryStorage;
use raftnode::{ProtocolState, RaftError};
use std::collections::HashMap;
use std::time::Duration;

const ADDRESSES: [&str; 3] = ["node1:1", "node2:2", "node3:3"];

fn set(key: &str, value: &str) -> ExecuteRequest {
    ExecuteRequest {
        command: "set".to_string(),
        key: key.to_string(),
        value: Some(value.to_string()),
    }
}

async fn value_everywhere(servers: &[RaftServer], key: &str, value: &str) {
    eventually(move || async move {
        let statuses = statuses(servers).await;
        statuses
            .iter()
            .all(|(_, s)| s.store.get(key).map(String::as_str) == Some(value))
            .then_some(())
    })
    .await
}

/// Waits until every node holds the same log and has committed all of it.
async fn identical_logs(servers: &[RaftServer]) {
    eventually(move || async move {
        let statuses = statuses(servers).await;
        let (_, first) = statuses.first()?;
        statuses
            .iter()
            .all(|(_, s)| s.logs == first.logs && s.commit_index == s.logs.len() as i64 - 1)
            .then_some(())
    })
    .await
}

#[tokio::test]
async fn elects_a_single_leader() {
    setup();
    let network = LocalNetwork::new();
    let nodes = start_cluster(&network, &ADDRESSES);
    let servers: Vec<RaftServer> = nodes.iter().map(|n| n.server()).collect();

    agreed_leader(&servers).await;

    let mut leaders: HashMap<u64, String> = HashMap::new();
    for _ in 0..30 {
        for (_, status) in statuses(&servers).await {
            if status.role == ProtocolState::Leader {
                let leader = leaders.entry(status.term).or_insert(status.id.clone());
                assert_eq!(*leader, status.id, "two leaders in term {}", status.term);
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for (server, node) in servers.iter().zip(nodes) {
        server.shutdown().await.unwrap();
        node.wait().await.unwrap();
    }
}

#[tokio::test]
async fn replicates_commands_to_every_node() {
    setup();
    let network = LocalNetwork::new();
    let nodes = start_cluster(&network, &ADDRESSES);
    let servers: Vec<RaftServer> = nodes.iter().map(|n| n.server()).collect();

    let leader = agreed_leader(&servers).await;
    let response = servers[leader].execute(set("foo", "bar")).await.unwrap();
    assert_eq!(response, ExecuteResponse::text("OK"));
    value_everywhere(&servers, "foo", "bar").await;
    identical_logs(&servers).await;

    for (_, status) in statuses(&servers).await {
        assert_eq!(status.commit_index, status.last_applied);
        assert_eq!(status.peers.len(), 2);
    }
}

#[tokio::test]
async fn followers_redirect_to_the_leader() {
    setup();
    let network = LocalNetwork::new();
    let nodes = start_cluster(&network, &ADDRESSES);
    let servers: Vec<RaftServer> = nodes.iter().map(|n| n.server()).collect();

    let leader = agreed_leader(&servers).await;
    let follower = (leader + 1) % servers.len();
    match servers[follower].execute(set("foo", "bar")).await {
        Err(RaftError::NotLeader { leader_address, .. }) => {
            assert_eq!(leader_address.as_deref(), Some(ADDRESSES[leader]))
        }
        other => panic!("follower accepted a command: {:?}", other),
    }
    assert!(servers[follower].ping().await.is_err());
    assert_eq!(servers[leader].ping().await, Ok("PONG".to_string()));
}

#[tokio::test]
async fn new_leader_after_leader_stops() {
    setup();
    let network = LocalNetwork::new();
    let mut nodes = start_cluster(&network, &ADDRESSES);
    let servers: Vec<RaftServer> = nodes.iter().map(|n| n.server()).collect();

    let old = agreed_leader(&servers).await;
    let old_term = servers[old].status().await.unwrap().term;
    servers[old].execute(set("before", "1")).await.unwrap();

    servers[old].shutdown().await.unwrap();
    nodes.remove(old).wait().await.unwrap();

    let new = agreed_leader(&servers).await;
    assert_ne!(new, old);
    assert!(servers[new].status().await.unwrap().term > old_term);

    // Two of three members are still a majority.
    servers[new].execute(set("after", "2")).await.unwrap();
    let remaining: Vec<RaftServer> = servers
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != old)
        .map(|(_, s)| s.clone())
        .collect();
    value_everywhere(&remaining, "before", "1").await;
    value_everywhere(&remaining, "after", "2").await;
}

#[tokio::test]
async fn members_join_and_leave() {
    setup();
    let network = LocalNetwork::new();
    let first = raftnode::start(test_config("node1:1", &[]), MemoryStorage::new(), &network)
        .unwrap();
    let first_server = first.server();
    agreed_leader(&[first_server.clone()]).await;
    first_server.execute(set("foo", "bar")).await.unwrap();

    let second = raftnode::start(
        test_config("node2:2", &["node1:1"]),
        MemoryStorage::new(),
        &network,
    )
    .unwrap();
    let second_server = second.server();

    // Unanswered elections push the newcomer's term past the leader's before it is added.
    tokio::time::sleep(Duration::from_millis(600)).await;
    let leader_term = first_server.status().await.unwrap().term;
    assert!(second_server.status().await.unwrap().term > leader_term);

    eventually(|| {
        let server = first_server.clone();
        async move { server.join_cluster("node2:2".to_string()).await.ok() }
    })
    .await;

    let servers = vec![first_server.clone(), second_server.clone()];
    value_everywhere(&servers, "foo", "bar").await;
    identical_logs(&servers).await;
    let leader = agreed_leader(&servers).await;
    for (_, status) in statuses(&servers).await {
        assert_eq!(status.peers.len(), 1);
    }

    // Removing the follower shuts it down.
    let follower = 1 - leader;
    let follower_address = servers[follower].status().await.unwrap().self_address;
    eventually(|| {
        let server = servers[leader].clone();
        let address = follower_address.clone();
        async move { server.remove_member(address).await.ok() }
    })
    .await;
    eventually(|| {
        let server = servers[follower].clone();
        async move { server.is_terminated().then_some(()) }
    })
    .await;

    let status = servers[leader].status().await.unwrap();
    assert!(status.peers.is_empty());
    let (removed, kept) = if follower == 0 {
        (first, second)
    } else {
        (second, first)
    };
    removed.wait().await.unwrap();
    servers[leader].shutdown().await.unwrap();
    kept.wait().await.unwrap();
}
