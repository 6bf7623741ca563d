//! Integration tests: key placement over several servers.

mod common;

use common::*;
use redshard::config::ShardSpec;
use redshard::sharding::ShardNode;
use redshard::{ConnectionPool, Hashing, Reply, ShardedClient, ShardedConfig, ShardedPipeline, TagPattern};

async fn shards(n: usize, hashing: Hashing) -> (ShardedClient, Vec<MockServer>) {
    let mut servers = Vec::new();
    let mut specs = Vec::new();
    for i in 0..n {
        let server = kv_server().await;
        specs.push(ShardSpec {
            id: format!("shard-{i}"),
            weight: 1,
            config: server.config(),
        });
        servers.push(server);
    }
    let client = ShardedClient::new(ShardedConfig {
        shards: specs,
        hashing,
        tag_pattern: Some(TagPattern::default()),
    })
    .unwrap();
    (client, servers)
}

fn owner_index(client: &ShardedClient, key: &str) -> usize {
    let id = client.shard_for(key).unwrap().id().to_string();
    id.trim_start_matches("shard-").parse().unwrap()
}

#[tokio::test]
async fn values_land_on_owning_shard_only() {
    for hashing in [Hashing::Murmur64A, Hashing::Md5] {
        let (client, servers) = shards(3, hashing).await;
        for i in 0..40 {
            let key = format!("user:{i}");
            client.set(&key, format!("v{i}")).await.unwrap();
        }
        for i in 0..40 {
            let key = format!("user:{i}");
            assert_eq!(
                client.get(&key).await.unwrap().as_deref(),
                Some(format!("v{i}").as_bytes())
            );
            let owner = owner_index(&client, &key);
            for (idx, server) in servers.iter().enumerate() {
                let touched = server
                    .received()
                    .iter()
                    .any(|cmd| cmd.get(1).map(|k| &k[..]) == Some(key.as_bytes()));
                assert_eq!(touched, idx == owner, "{key} on shard {idx}");
            }
        }
        let used = servers.iter().filter(|s| s.connections() > 0).count();
        assert!(used > 1, "keys should spread over shards");
    }
}

#[tokio::test]
async fn hash_tags_colocate_related_keys() {
    let (client, _servers) = shards(4, Hashing::default()).await;
    let keys = ["{cart:9}:items", "{cart:9}:total", "{cart:9}"];
    let owners: Vec<_> = keys.iter().map(|k| owner_index(&client, k)).collect();
    assert!(owners.windows(2).all(|w| w[0] == w[1]));
}

#[tokio::test]
async fn sharded_pipeline_keeps_order() {
    let (client, _servers) = shards(3, Hashing::default()).await;
    let mut p = ShardedPipeline::new();
    for i in 0..15 {
        p.set(format!("k{i}"), format!("{i}"));
    }
    for i in 0..15 {
        p.incr(format!("k{i}"));
    }
    let replies = client.pipeline(&p).await.unwrap();
    assert_eq!(replies.len(), 30);
    assert!(replies[..15].iter().all(|r| *r == Reply::status("OK")));
    for i in 0..15 {
        assert_eq!(replies[15 + i], Reply::Integer(i as i64 + 1));
    }
}

#[tokio::test]
async fn adding_a_shard_moves_only_some_keys() {
    let (client, _servers) = shards(3, Hashing::default()).await;
    let keys: Vec<String> = (0..300).map(|i| format!("item:{i}")).collect();
    let before: Vec<_> = keys.iter().map(|k| owner_index(&client, k)).collect();

    let extra = kv_server().await;
    let node = ShardNode::new("shard-3", 1, ConnectionPool::new(extra.config())).unwrap();
    client.ring().add_node(node).unwrap();

    let mut moved = 0;
    for (key, old) in keys.iter().zip(before) {
        let new = owner_index(&client, key);
        if new != old {
            assert_eq!(new, 3);
            moved += 1;
        }
    }
    assert!(moved > 0 && moved < keys.len() / 2);
}
