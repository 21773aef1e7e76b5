use async_trait::async_trait;

use crate::types::{
    Channel, ChannelEdge, Invoice, NodeInfo, NodePair, PaymentResult, Route, RouteRequest,
};

/// Trait abstracting the LND RPC surface the rebalancer consumes.
///
/// This enables mock-based integration testing without a live node.
#[async_trait]
pub trait LndClient: Send + Sync {
    /// `GetInfo`, reduced to the identity pubkey.
    async fn get_info(&self) -> anyhow::Result<String>;
    async fn list_channels(
        &self,
        active_only: bool,
        public_only: bool,
        peer: Option<&str>,
    ) -> anyhow::Result<Vec<Channel>>;
    async fn get_chan_info(&self, chan_id: u64) -> anyhow::Result<ChannelEdge>;
    async fn get_node_info(&self, pub_key: &str) -> anyhow::Result<NodeInfo>;
    async fn query_routes(&self, req: &RouteRequest) -> anyhow::Result<Vec<Route>>;
    async fn add_invoice(&self, value_sat: i64, memo: &str) -> anyhow::Result<Invoice>;
    /// `SendToRouteV2`: dispatch along a pinned route and wait for the
    /// terminal HTLC status. `payment_addr` is attached to the final hop's
    /// MPP record when present; probe payments omit it.
    async fn send_to_route(
        &self,
        payment_hash: &[u8],
        payment_addr: Option<&[u8]>,
        route: &Route,
    ) -> anyhow::Result<PaymentResult>;
    async fn query_mission_control(&self) -> anyhow::Result<Vec<NodePair>>;
    /// `XImportMissionControl`: push observed failures (pair, failed
    /// amount in msat) so route queries steer around them.
    async fn import_mission_control(&self, pairs: &[(NodePair, i64)]) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Mock client for integration testing
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::types::{FailureCode, Hop, PaymentFailure};
    use anyhow::{anyhow, bail};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    fn edge_fee(edge: Option<&ChannelEdge>, sender: &str, amt_msat: i64) -> i64 {
        edge.and_then(|e| e.direction_policy(sender))
            .map(|p| p.fee_msat(amt_msat))
            .unwrap_or(0)
    }

    /// Mock LND client simulating a three-hop circular network:
    /// us -> source peer -> target peer -> us. Channels and edges are preset
    /// by tests; payment outcomes follow `liquidity_cap_msat` (the largest
    /// amount the last hop can deliver) and whether the payment hash belongs
    /// to an invoice this mock issued.
    pub struct MockLndClient {
        pub identity: String,
        pub channels: Mutex<Vec<Channel>>,
        pub edges: Mutex<HashMap<u64, ChannelEdge>>,
        pub node_infos: Mutex<HashMap<String, NodeInfo>>,
        pub mc_pairs: Vec<NodePair>,
        pub liquidity_cap_msat: Mutex<Option<i64>>,
        /// Apply balance shifts to `channels` on settled payments.
        pub settle_payments: bool,
        /// Artificial latency for `query_routes` (session timeout tests).
        pub route_delay: Option<Duration>,
        /// One-shot failure override for the next dispatched payment.
        pub forced_failure: Mutex<Option<PaymentFailure>>,
        pub transit_chan_id: u64,
        // Call recorders
        pub query_routes_calls: Mutex<Vec<RouteRequest>>,
        pub sent_routes: Mutex<Vec<(Vec<u8>, Route)>>,
        pub imported_pairs: Mutex<Vec<(NodePair, i64)>>,
        pub invoices_issued: Mutex<Vec<Invoice>>,
        known_hashes: Mutex<HashMap<Vec<u8>, i64>>,
    }

    impl MockLndClient {
        pub fn new(identity: &str) -> Self {
            Self {
                identity: identity.to_string(),
                channels: Mutex::new(Vec::new()),
                edges: Mutex::new(HashMap::new()),
                node_infos: Mutex::new(HashMap::new()),
                mc_pairs: Vec::new(),
                liquidity_cap_msat: Mutex::new(None),
                settle_payments: false,
                route_delay: None,
                forced_failure: Mutex::new(None),
                transit_chan_id: 777,
                query_routes_calls: Mutex::new(Vec::new()),
                sent_routes: Mutex::new(Vec::new()),
                imported_pairs: Mutex::new(Vec::new()),
                invoices_issued: Mutex::new(Vec::new()),
                known_hashes: Mutex::new(HashMap::new()),
            }
        }
    }

    #[async_trait]
    impl LndClient for MockLndClient {
        async fn get_info(&self) -> anyhow::Result<String> {
            Ok(self.identity.clone())
        }

        async fn list_channels(
            &self,
            active_only: bool,
            _public_only: bool,
            peer: Option<&str>,
        ) -> anyhow::Result<Vec<Channel>> {
            let channels = self.channels.lock().unwrap();
            Ok(channels
                .iter()
                .filter(|c| !active_only || c.active)
                .filter(|c| peer.map_or(true, |p| c.remote_pubkey == p))
                .cloned()
                .collect())
        }

        async fn get_chan_info(&self, chan_id: u64) -> anyhow::Result<ChannelEdge> {
            self.edges
                .lock()
                .unwrap()
                .get(&chan_id)
                .cloned()
                .ok_or_else(|| anyhow!("edge not found for channel {}", chan_id))
        }

        async fn get_node_info(&self, pub_key: &str) -> anyhow::Result<NodeInfo> {
            Ok(self
                .node_infos
                .lock()
                .unwrap()
                .get(pub_key)
                .cloned()
                .unwrap_or_else(|| NodeInfo {
                    pub_key: pub_key.to_string(),
                    alias: format!("node-{}", &pub_key[..pub_key.len().min(6)]),
                    last_update: 0,
                    num_channels: 1,
                }))
        }

        async fn query_routes(&self, req: &RouteRequest) -> anyhow::Result<Vec<Route>> {
            self.query_routes_calls.lock().unwrap().push(req.clone());
            if let Some(delay) = self.route_delay {
                tokio::time::sleep(delay).await;
            }

            let channels = self.channels.lock().unwrap();
            let edges = self.edges.lock().unwrap();

            let src = channels
                .iter()
                .find(|c| c.chan_id == req.outgoing_chan_id)
                .ok_or_else(|| anyhow!("unknown outgoing channel {}", req.outgoing_chan_id))?;
            let src_peer = src.remote_pubkey.clone();

            // Target edge: the channel between us and the last-hop peer.
            let target = edges
                .values()
                .find(|e| {
                    (e.node1_pub == self.identity && e.node2_pub == req.last_hop_pubkey)
                        || (e.node2_pub == self.identity && e.node1_pub == req.last_hop_pubkey)
                })
                .ok_or_else(|| anyhow!("unable to find a path to destination"))?;
            let (_, peer_policy) = target.peer_side(&self.identity)?;

            let last_fee = peer_policy.fee_msat(req.amt_msat);
            let transit_amt = req.amt_msat + last_fee;
            let transit_fee = edge_fee(edges.get(&self.transit_chan_id), &src_peer, transit_amt);
            let first_amt = transit_amt + transit_fee;
            let first_fee = edge_fee(edges.get(&req.outgoing_chan_id), &self.identity, first_amt);

            let route = Route {
                total_time_lock: 144,
                total_amt_msat: first_amt + first_fee,
                total_fees_msat: first_fee + transit_fee + last_fee,
                hops: vec![
                    Hop {
                        chan_id: req.outgoing_chan_id,
                        pub_key: src_peer,
                        amt_to_forward_msat: first_amt,
                        fee_msat: first_fee,
                        expiry: 144,
                    },
                    Hop {
                        chan_id: self.transit_chan_id,
                        pub_key: req.last_hop_pubkey.clone(),
                        amt_to_forward_msat: transit_amt,
                        fee_msat: transit_fee,
                        expiry: 104,
                    },
                    Hop {
                        chan_id: target.channel_id,
                        pub_key: self.identity.clone(),
                        amt_to_forward_msat: req.amt_msat,
                        fee_msat: last_fee,
                        expiry: 64,
                    },
                ],
            };

            if route.network_fee_msat() > req.fee_limit_msat {
                bail!("unable to find a path to destination");
            }
            Ok(vec![route])
        }

        async fn add_invoice(&self, value_sat: i64, _memo: &str) -> anyhow::Result<Invoice> {
            let mut hash = vec![0u8; 24];
            hash.extend_from_slice(&value_sat.to_be_bytes());
            let mut addr = vec![0xAAu8; 24];
            addr.extend_from_slice(&value_sat.to_be_bytes());
            let invoice = Invoice {
                payment_hash: hash.clone(),
                payment_request: format!("lnbc_mock_{}", value_sat),
                payment_addr: addr,
            };
            self.known_hashes.lock().unwrap().insert(hash, value_sat);
            self.invoices_issued.lock().unwrap().push(invoice.clone());
            Ok(invoice)
        }

        async fn send_to_route(
            &self,
            payment_hash: &[u8],
            _payment_addr: Option<&[u8]>,
            route: &Route,
        ) -> anyhow::Result<PaymentResult> {
            self.sent_routes
                .lock()
                .unwrap()
                .push((payment_hash.to_vec(), route.clone()));

            let last = route.hops.last().ok_or_else(|| anyhow!("empty route"))?;
            let last_index = route.hops.len() - 1;

            if let Some(failure) = self.forced_failure.lock().unwrap().take() {
                return Ok(PaymentResult::Failed(failure));
            }

            if let Some(cap) = *self.liquidity_cap_msat.lock().unwrap() {
                if last.amt_to_forward_msat > cap {
                    return Ok(PaymentResult::Failed(PaymentFailure {
                        code: FailureCode::TemporaryChannelFailure,
                        hop_index: last_index,
                    }));
                }
            }

            let known = self.known_hashes.lock().unwrap().contains_key(payment_hash);
            if !known {
                // Probe payments carry a hash we never issued; the final hop
                // rejects them once the HTLC made it all the way through.
                return Ok(PaymentResult::Failed(PaymentFailure {
                    code: FailureCode::IncorrectPaymentDetails,
                    hop_index: last_index,
                }));
            }

            if self.settle_payments {
                let mut channels = self.channels.lock().unwrap();
                let spent_sat = route.total_amt_msat / 1000;
                let received_sat = last.amt_to_forward_msat / 1000;
                let first_chan = route.hops[0].chan_id;
                if let Some(c) = channels.iter_mut().find(|c| c.chan_id == first_chan) {
                    c.local_balance -= spent_sat;
                    c.remote_balance += spent_sat;
                }
                if let Some(c) = channels.iter_mut().find(|c| c.chan_id == last.chan_id) {
                    c.local_balance += received_sat;
                    c.remote_balance -= received_sat;
                }
            }

            Ok(PaymentResult::Succeeded {
                fee_msat: route.network_fee_msat(),
            })
        }

        async fn query_mission_control(&self) -> anyhow::Result<Vec<NodePair>> {
            Ok(self.mc_pairs.clone())
        }

        async fn import_mission_control(&self, pairs: &[(NodePair, i64)]) -> anyhow::Result<()> {
            self.imported_pairs
                .lock()
                .unwrap()
                .extend(pairs.iter().cloned());
            Ok(())
        }
    }
}
