use anyhow::bail;
use serde::{Deserialize, Serialize};

/// One of our own channels as reported by `ListChannels`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub chan_id: u64,
    pub remote_pubkey: String,
    pub capacity: i64,
    pub local_balance: i64,
    pub remote_balance: i64,
    pub active: bool,
}

/// A directed fee schedule advertised for one side of a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingPolicy {
    pub fee_base_msat: i64,
    pub fee_rate_milli_msat: i64,
    pub time_lock_delta: u32,
    pub min_htlc_msat: i64,
    pub max_htlc_msat: i64,
}

impl RoutingPolicy {
    /// Fee for forwarding `amt_msat` under this policy.
    pub fn fee_msat(&self, amt_msat: i64) -> i64 {
        self.fee_base_msat + amt_msat * self.fee_rate_milli_msat / 1_000_000
    }
}

/// Graph-global view of a channel: both endpoints and both directional
/// policies.
#[derive(Debug, Clone, Default)]
pub struct ChannelEdge {
    pub channel_id: u64,
    pub node1_pub: String,
    pub node2_pub: String,
    pub node1_policy: Option<RoutingPolicy>,
    pub node2_policy: Option<RoutingPolicy>,
}

impl ChannelEdge {
    /// The peer endpoint of this edge and its advertised policy, given our
    /// own identity key. The peer-side policy is what routing through this
    /// channel towards us costs, and the peer key doubles as the route's
    /// last-hop constraint.
    pub fn peer_side(&self, my_pk: &str) -> anyhow::Result<(&str, &RoutingPolicy)> {
        let (pk, policy) = if self.node1_pub == my_pk {
            (self.node2_pub.as_str(), self.node2_policy.as_ref())
        } else {
            (self.node1_pub.as_str(), self.node1_policy.as_ref())
        };
        match policy {
            Some(p) => Ok((pk, p)),
            None => bail!("channel {} has no policy for peer {}", self.channel_id, pk),
        }
    }

    /// The policy governing a forward sent across this channel by `sender`.
    pub fn direction_policy(&self, sender: &str) -> Option<&RoutingPolicy> {
        if self.node1_pub == sender {
            self.node1_policy.as_ref()
        } else if self.node2_pub == sender {
            self.node2_policy.as_ref()
        } else {
            None
        }
    }
}

/// A single hop of a route. `pub_key` is the node receiving on this hop and
/// `fee_msat` is the fee for carrying the payment across this hop's channel.
#[derive(Debug, Clone)]
pub struct Hop {
    pub chan_id: u64,
    pub pub_key: String,
    pub amt_to_forward_msat: i64,
    pub fee_msat: i64,
    pub expiry: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Route {
    pub total_time_lock: u32,
    pub total_amt_msat: i64,
    pub total_fees_msat: i64,
    pub hops: Vec<Hop>,
}

impl Route {
    /// The fee actually paid to the network. The first hop is our own
    /// channel, so its fee is not a cost to us.
    pub fn network_fee_msat(&self) -> i64 {
        match self.hops.first() {
            Some(first) => self.total_fees_msat - first.fee_msat,
            None => 0,
        }
    }
}

/// Summary info for a remote node, cacheable across runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub pub_key: String,
    pub alias: String,
    pub last_update: i64,
    pub num_channels: u32,
}

/// An invoice we issued against ourselves for a given amount.
#[derive(Debug, Clone, Default)]
pub struct Invoice {
    pub payment_hash: Vec<u8>,
    pub payment_request: String,
    pub payment_addr: Vec<u8>,
}

/// A directed node pair observed to fail, fed back into mission control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePair {
    pub node_from: String,
    pub node_to: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    TemporaryChannelFailure,
    IncorrectPaymentDetails,
    Other(i32),
}

/// Terminal failure attribution for a dispatched payment.
/// `hop_index` is the 0-based index into the route's hops at which the
/// failure was generated; the last index means the failure came from the
/// final hop.
#[derive(Debug, Clone)]
pub struct PaymentFailure {
    pub code: FailureCode,
    pub hop_index: usize,
}

#[derive(Debug, Clone)]
pub enum PaymentResult {
    Succeeded { fee_msat: i64 },
    Failed(PaymentFailure),
}

/// Parameters of a route query, constrained for a self-payment out of a
/// specific channel and back in through a specific peer.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub pub_key: String,
    pub outgoing_chan_id: u64,
    pub last_hop_pubkey: String,
    pub amt_msat: i64,
    pub fee_limit_msat: i64,
    pub use_mission_control: bool,
}
