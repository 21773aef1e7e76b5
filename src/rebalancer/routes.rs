use std::time::Duration;

use anyhow::anyhow;
use log::{info, warn};
use tokio::time::Instant;

use crate::client::LndClient;
use crate::deadline::Deadline;
use crate::rebalancer::{pair_key, FailedRoute, Rebalancer};
use crate::types::{ChannelEdge, NodePair, Route, RouteRequest};

fn mc_key(pair: &NodePair) -> String {
    format!("{}\u{2192}{}", pair.node_from, pair.node_to)
}

impl<C: LndClient> Rebalancer<C> {
    /// Channel edge lookup through the process-lifetime cache.
    pub(crate) async fn get_chan_info(
        &mut self,
        deadline: &Deadline,
        chan_id: u64,
    ) -> anyhow::Result<ChannelEdge> {
        if let Some(edge) = self.chan_cache.get(&chan_id) {
            return Ok(edge.clone());
        }
        let edge = deadline.run(self.client.get_chan_info(chan_id)).await?;
        self.chan_cache.insert(chan_id, edge.clone());
        Ok(edge)
    }

    /// The most we are willing to pay to move `amt_msat` into the target
    /// channel: the cheapest of the configured limits, derived from what
    /// routing that amount out of the target would earn us.
    pub(crate) async fn fee_limit_msat(
        &mut self,
        deadline: &Deadline,
        from: u64,
        to: u64,
        amt_msat: i64,
    ) -> anyhow::Result<i64> {
        let to_edge = self.get_chan_info(deadline, to).await?;
        let (_, to_policy) = to_edge.peer_side(&self.my_pk)?;
        let policy_fee = to_policy.fee_msat(amt_msat) as f64;

        let mut limit = f64::MAX;
        if self.config.econ_ratio > 0.0 {
            limit = limit.min(policy_fee * self.config.econ_ratio);
        }
        if self.config.econ_ratio_max_ppm > 0 {
            limit = limit.min(amt_msat as f64 * self.config.econ_ratio_max_ppm as f64 / 1e6);
        }
        if self.config.fee_limit_ppm > 0 {
            limit = limit.min(amt_msat as f64 * self.config.fee_limit_ppm as f64 / 1e6);
        }
        if limit == f64::MAX {
            return Err(anyhow!("no fee limit mode configured"));
        }
        if self.config.lost_profit {
            let from_edge = self.get_chan_info(deadline, from).await?;
            let (_, from_policy) = from_edge.peer_side(&self.my_pk)?;
            limit -= from_policy.fee_msat(amt_msat) as f64;
        }
        Ok(limit as i64)
    }

    /// Query candidate routes for a picked pair, constrained to the outgoing
    /// channel and the target peer as last hop, under the computed fee
    /// ceiling. Returns the routes together with the ceiling used.
    pub(crate) async fn get_routes(
        &mut self,
        deadline: &Deadline,
        from: u64,
        to: u64,
        amt_msat: i64,
    ) -> anyhow::Result<(Vec<Route>, i64)> {
        let fee_limit = self.fee_limit_msat(deadline, from, to, amt_msat).await?;
        let to_edge = self.get_chan_info(deadline, to).await?;
        let (last_hop, _) = to_edge.peer_side(&self.my_pk)?;
        let last_hop = last_hop.to_string();

        self.flush_mission_control(deadline).await;

        let req = RouteRequest {
            pub_key: self.my_pk.clone(),
            outgoing_chan_id: from,
            last_hop_pubkey: last_hop,
            amt_msat,
            fee_limit_msat: fee_limit,
            use_mission_control: true,
        };
        let routes = deadline.run(self.client.query_routes(&req)).await?;
        Ok((routes, fee_limit))
    }

    /// Recompute a route's per-hop amounts and fees for a new amount,
    /// walking back from the destination and applying each hop channel's
    /// policy for the direction of travel.
    pub(crate) async fn rebuild_route(
        &mut self,
        deadline: &Deadline,
        route: &Route,
        amount_sat: i64,
    ) -> anyhow::Result<Route> {
        let mut hops = route.hops.clone();
        let mut amt_msat = amount_sat * 1000;
        for i in (0..hops.len()).rev() {
            let sender = if i == 0 {
                self.my_pk.clone()
            } else {
                hops[i - 1].pub_key.clone()
            };
            let edge = self.get_chan_info(deadline, hops[i].chan_id).await?;
            let policy = edge.direction_policy(&sender).ok_or_else(|| {
                anyhow!("no routing policy for {} on channel {}", sender, hops[i].chan_id)
            })?;
            let fee = policy.fee_msat(amt_msat);
            hops[i].amt_to_forward_msat = amt_msat;
            hops[i].fee_msat = fee;
            amt_msat += fee;
        }
        Ok(Route {
            total_time_lock: route.total_time_lock,
            total_amt_msat: amt_msat,
            total_fees_msat: hops.iter().map(|h| h.fee_msat).sum(),
            hops,
        })
    }

    /// Mark a channel pair as recently failed and drop it from the working
    /// set until the entry expires.
    pub(crate) fn add_failed_route(&mut self, from: u64, to: u64, ttl: Duration) {
        let key = pair_key(from, to);
        self.failure_cache.insert(
            key.clone(),
            FailedRoute {
                expires_at: Instant::now() + ttl,
            },
        );
        self.channel_pairs.remove(&key);
    }

    /// Record a failing directed edge of a route for mission control.
    pub(crate) fn record_failed_pair(&mut self, route: &Route, hop_index: usize) {
        let Some(hop) = route.hops.get(hop_index) else {
            return;
        };
        let node_from = if hop_index == 0 {
            self.my_pk.clone()
        } else {
            route.hops[hop_index - 1].pub_key.clone()
        };
        let pair = NodePair {
            node_from,
            node_to: hop.pub_key.clone(),
        };
        self.mc_cache.insert(mc_key(&pair), hop.amt_to_forward_msat);
        self.failed_pairs.push((pair, hop.amt_to_forward_msat));
    }

    /// Push the failures observed since the last route query into the
    /// node's mission control. Errors are not fatal; the pairs are retried
    /// on the next query.
    pub(crate) async fn flush_mission_control(&mut self, deadline: &Deadline) {
        if self.failed_pairs.is_empty() {
            return;
        }
        let pairs = std::mem::take(&mut self.failed_pairs);
        if let Err(e) = deadline.run(self.client.import_mission_control(&pairs)).await {
            warn!("Failed to import mission control data: {:#}", e);
            self.failed_pairs = pairs;
        }
    }

    /// Seed the mission-control cache from the node's own history so early
    /// route queries already avoid known-bad links.
    pub(crate) async fn warm_mission_control(&mut self, deadline: &Deadline) {
        match deadline.run(self.client.query_mission_control()).await {
            Ok(pairs) => {
                for pair in pairs {
                    self.mc_cache.entry(mc_key(&pair)).or_insert(0);
                }
                info!("Mission control cache primed with {} pairs", self.mc_cache.len());
            }
            Err(e) => warn!("Failed to query mission control: {:#}", e),
        }
    }

    /// Log a route hop by hop, resolving aliases through the node cache.
    pub(crate) async fn log_route(&mut self, deadline: &Deadline, route: &Route) {
        info!("Network fee: {} msat", route.network_fee_msat());
        for (i, hop) in route.hops.iter().enumerate() {
            let (alias, hit) = match self.node_alias(deadline, &hop.pub_key).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("Failed to resolve node {}: {:#}", hop.pub_key, e);
                    continue;
                }
            };
            let marker = if self.config.node_cache_info {
                if hit {
                    " [cached]"
                } else {
                    " [fresh]"
                }
            } else {
                ""
            };
            if i == 0 {
                info!("  {} {:>8} {}{}", hop.chan_id, "", alias, marker);
            } else {
                info!("  {} {:>8} {}{}", hop.chan_id, hop.fee_msat, alias, marker);
            }
        }
    }

    /// Resolve a node's alias, filling the persistent node cache on miss.
    /// Returns the alias and whether it was served from the cache.
    pub(crate) async fn node_alias(
        &mut self,
        deadline: &Deadline,
        pub_key: &str,
    ) -> anyhow::Result<(String, bool)> {
        {
            let cache = self.node_cache.lock().unwrap();
            if let Some(cached) = cache.get(pub_key) {
                return Ok((cached.info.alias.clone(), true));
            }
        }
        let node = deadline.run(self.client.get_node_info(pub_key)).await?;
        let alias = node.alias.clone();
        self.node_cache.lock().unwrap().insert(node);
        Ok((alias, false))
    }
}
