//! Shared fixtures for the engine tests: the two-channel network from the
//! basic rebalance scenario, with A local-heavy (source) and B local-light
//! (target) and a free transit link between the two peers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::mock::MockLndClient;
use crate::config::Config;
use crate::deadline::Deadline;
use crate::node_cache::NodeCache;
use crate::rebalancer::Rebalancer;
use crate::types::{Channel, ChannelEdge, RoutingPolicy};

pub(crate) const ME: &str = "03aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
pub(crate) const PEER_A: &str =
    "02bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
pub(crate) const PEER_B: &str =
    "02cccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccccc";

pub(crate) fn policy(base: i64, ppm: i64) -> RoutingPolicy {
    RoutingPolicy {
        fee_base_msat: base,
        fee_rate_milli_msat: ppm,
        time_lock_delta: 40,
        min_htlc_msat: 1000,
        max_htlc_msat: 990_000_000,
    }
}

pub(crate) fn chan(id: u64, peer: &str, capacity: i64, local: i64) -> Channel {
    Channel {
        chan_id: id,
        remote_pubkey: peer.to_string(),
        capacity,
        local_balance: local,
        remote_balance: capacity - local,
        active: true,
    }
}

pub(crate) fn scenario_mock() -> MockLndClient {
    let mock = MockLndClient::new(ME);
    {
        let mut channels = mock.channels.lock().unwrap();
        channels.push(chan(101, PEER_A, 1_000_000, 900_000));
        channels.push(chan(202, PEER_B, 1_000_000, 100_000));
    }
    {
        let mut edges = mock.edges.lock().unwrap();
        edges.insert(
            101,
            ChannelEdge {
                channel_id: 101,
                node1_pub: ME.to_string(),
                node2_pub: PEER_A.to_string(),
                node1_policy: Some(policy(0, 0)),
                node2_policy: Some(policy(1_000, 100)),
            },
        );
        edges.insert(
            202,
            ChannelEdge {
                channel_id: 202,
                node1_pub: ME.to_string(),
                node2_pub: PEER_B.to_string(),
                node1_policy: Some(policy(0, 0)),
                node2_policy: Some(policy(1_000, 500)),
            },
        );
        edges.insert(
            777,
            ChannelEdge {
                channel_id: 777,
                node1_pub: PEER_A.to_string(),
                node2_pub: PEER_B.to_string(),
                node1_policy: Some(policy(0, 0)),
                node2_policy: Some(policy(0, 0)),
            },
        );
    }
    mock
}

pub(crate) fn base_config() -> Config {
    Config {
        amount: 100_000,
        ..Default::default()
    }
}

/// Engine over the scenario mock with channels preloaded, skipping the RPC
/// startup sequence.
pub(crate) fn scenario_engine(config: Config) -> Rebalancer<MockLndClient> {
    let mut config = config;
    config.preflight().unwrap();
    let mut r = Rebalancer::new(
        scenario_mock(),
        config,
        Arc::new(Mutex::new(NodeCache::default())),
    );
    r.my_pk = ME.to_string();
    r.channels = r.client.channels.lock().unwrap().clone();
    r
}

pub(crate) fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(30))
}
