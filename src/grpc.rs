use std::path::PathBuf;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tonic_lnd::lnrpc;
use tonic_lnd::routerrpc;

use crate::client::LndClient;
use crate::config::Config;
use crate::types::{
    Channel, ChannelEdge, FailureCode, Hop, Invoice, NodeInfo, NodePair, PaymentFailure,
    PaymentResult, Route, RouteRequest, RoutingPolicy,
};

/// LND gRPC connector. The tonic service stubs take `&mut self`, so the
/// client lives behind an async mutex; the engine is single-worker anyway.
pub struct LndGrpcClient {
    inner: Mutex<tonic_lnd::Client>,
}

impl LndGrpcClient {
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let address = format!("https://{}", config.connect);
        let cert = if config.tlscert.is_empty() {
            home_dir()?.join(".lnd").join("tls.cert")
        } else {
            PathBuf::from(&config.tlscert)
        };
        let macaroon_dir = if config.macaroon_dir.is_empty() {
            home_dir()?
                .join(".lnd")
                .join("data")
                .join("chain")
                .join("bitcoin")
                .join(&config.network)
        } else {
            PathBuf::from(&config.macaroon_dir)
        };
        let macaroon = macaroon_dir.join(&config.macaroon_filename);

        let client = tonic_lnd::connect(address, cert, macaroon)
            .await
            .map_err(|e| anyhow!("failed to connect to lnd at {}: {}", config.connect, e))?;
        Ok(Self {
            inner: Mutex::new(client),
        })
    }
}

fn home_dir() -> anyhow::Result<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("HOME is not set, pass --tlscert and --macaroon-dir explicitly"))
}

fn channel_from_rpc(c: lnrpc::Channel) -> Channel {
    Channel {
        chan_id: c.chan_id,
        remote_pubkey: c.remote_pubkey,
        capacity: c.capacity,
        local_balance: c.local_balance,
        remote_balance: c.remote_balance,
        active: c.active,
    }
}

fn policy_from_rpc(p: lnrpc::RoutingPolicy) -> RoutingPolicy {
    RoutingPolicy {
        fee_base_msat: p.fee_base_msat,
        fee_rate_milli_msat: p.fee_rate_milli_msat,
        time_lock_delta: p.time_lock_delta,
        min_htlc_msat: p.min_htlc,
        max_htlc_msat: p.max_htlc_msat as i64,
    }
}

fn edge_from_rpc(e: lnrpc::ChannelEdge) -> ChannelEdge {
    ChannelEdge {
        channel_id: e.channel_id,
        node1_pub: e.node1_pub,
        node2_pub: e.node2_pub,
        node1_policy: e.node1_policy.map(policy_from_rpc),
        node2_policy: e.node2_policy.map(policy_from_rpc),
    }
}

fn route_from_rpc(r: lnrpc::Route) -> Route {
    Route {
        total_time_lock: r.total_time_lock,
        total_amt_msat: r.total_amt_msat,
        total_fees_msat: r.total_fees_msat,
        hops: r
            .hops
            .into_iter()
            .map(|h| Hop {
                chan_id: h.chan_id,
                pub_key: h.pub_key,
                amt_to_forward_msat: h.amt_to_forward_msat,
                fee_msat: h.fee_msat,
                expiry: h.expiry,
            })
            .collect(),
    }
}

fn route_to_rpc(route: &Route, payment_addr: Option<&[u8]>) -> lnrpc::Route {
    let last_index = route.hops.len().saturating_sub(1);
    let deliver_msat = route.hops.last().map_or(0, |h| h.amt_to_forward_msat);
    lnrpc::Route {
        total_time_lock: route.total_time_lock,
        total_fees_msat: route.total_fees_msat,
        total_amt_msat: route.total_amt_msat,
        hops: route
            .hops
            .iter()
            .enumerate()
            .map(|(i, h)| lnrpc::Hop {
                chan_id: h.chan_id,
                pub_key: h.pub_key.clone(),
                amt_to_forward_msat: h.amt_to_forward_msat,
                fee_msat: h.fee_msat,
                expiry: h.expiry,
                tlv_payload: true,
                mpp_record: match (i == last_index, payment_addr) {
                    (true, Some(addr)) => Some(lnrpc::MppRecord {
                        payment_addr: addr.to_vec(),
                        total_amt_msat: deliver_msat,
                    }),
                    _ => None,
                },
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn failure_from_rpc(f: lnrpc::Failure, hops: usize) -> PaymentFailure {
    let code = if f.code == lnrpc::failure::FailureCode::TemporaryChannelFailure as i32 {
        FailureCode::TemporaryChannelFailure
    } else if f.code == lnrpc::failure::FailureCode::IncorrectOrUnknownPaymentDetails as i32 {
        FailureCode::IncorrectPaymentDetails
    } else {
        FailureCode::Other(f.code)
    };
    // lnd reports the failing node's index with ourselves at 0; our hop
    // indices start at the first forwarding channel.
    let hop_index = (f.failure_source_index as usize)
        .saturating_sub(1)
        .min(hops.saturating_sub(1));
    PaymentFailure { code, hop_index }
}

#[async_trait]
impl LndClient for LndGrpcClient {
    async fn get_info(&self) -> anyhow::Result<String> {
        let mut client = self.inner.lock().await;
        let info = client
            .lightning()
            .get_info(lnrpc::GetInfoRequest {})
            .await
            .context("GetInfo failed")?
            .into_inner();
        Ok(info.identity_pubkey)
    }

    async fn list_channels(
        &self,
        active_only: bool,
        public_only: bool,
        peer: Option<&str>,
    ) -> anyhow::Result<Vec<Channel>> {
        let peer_bytes = match peer {
            Some(pk) => hex::decode(pk).context("bad peer pubkey")?,
            None => Vec::new(),
        };
        let mut client = self.inner.lock().await;
        let resp = client
            .lightning()
            .list_channels(lnrpc::ListChannelsRequest {
                active_only,
                public_only,
                peer: peer_bytes,
                ..Default::default()
            })
            .await
            .context("ListChannels failed")?
            .into_inner();
        Ok(resp.channels.into_iter().map(channel_from_rpc).collect())
    }

    async fn get_chan_info(&self, chan_id: u64) -> anyhow::Result<ChannelEdge> {
        let mut client = self.inner.lock().await;
        let edge = client
            .lightning()
            .get_chan_info(lnrpc::ChanInfoRequest {
                chan_id,
                ..Default::default()
            })
            .await
            .with_context(|| format!("GetChanInfo failed for channel {}", chan_id))?
            .into_inner();
        Ok(edge_from_rpc(edge))
    }

    async fn get_node_info(&self, pub_key: &str) -> anyhow::Result<NodeInfo> {
        let mut client = self.inner.lock().await;
        let info = client
            .lightning()
            .get_node_info(lnrpc::NodeInfoRequest {
                pub_key: pub_key.to_string(),
                include_channels: false,
            })
            .await
            .with_context(|| format!("GetNodeInfo failed for {}", pub_key))?
            .into_inner();
        let node = info.node.unwrap_or_default();
        Ok(NodeInfo {
            pub_key: node.pub_key,
            alias: node.alias,
            last_update: node.last_update as i64,
            num_channels: info.num_channels,
        })
    }

    async fn query_routes(&self, req: &RouteRequest) -> anyhow::Result<Vec<Route>> {
        let last_hop = hex::decode(&req.last_hop_pubkey).context("bad last hop pubkey")?;
        let mut client = self.inner.lock().await;
        let resp = client
            .lightning()
            .query_routes(lnrpc::QueryRoutesRequest {
                pub_key: req.pub_key.clone(),
                outgoing_chan_id: req.outgoing_chan_id,
                last_hop_pubkey: last_hop,
                amt_msat: req.amt_msat,
                use_mission_control: req.use_mission_control,
                fee_limit: Some(lnrpc::FeeLimit {
                    limit: Some(lnrpc::fee_limit::Limit::FixedMsat(req.fee_limit_msat)),
                }),
                ..Default::default()
            })
            .await
            .context("QueryRoutes failed")?
            .into_inner();
        Ok(resp.routes.into_iter().map(route_from_rpc).collect())
    }

    async fn add_invoice(&self, value_sat: i64, memo: &str) -> anyhow::Result<Invoice> {
        let mut client = self.inner.lock().await;
        let resp = client
            .lightning()
            .add_invoice(lnrpc::Invoice {
                value: value_sat,
                memo: memo.to_string(),
                ..Default::default()
            })
            .await
            .context("AddInvoice failed")?
            .into_inner();
        Ok(Invoice {
            payment_hash: resp.r_hash,
            payment_request: resp.payment_request,
            payment_addr: resp.payment_addr,
        })
    }

    async fn send_to_route(
        &self,
        payment_hash: &[u8],
        payment_addr: Option<&[u8]>,
        route: &Route,
    ) -> anyhow::Result<PaymentResult> {
        let mut client = self.inner.lock().await;
        let attempt = client
            .router()
            .send_to_route_v2(routerrpc::SendToRouteRequest {
                payment_hash: payment_hash.to_vec(),
                route: Some(route_to_rpc(route, payment_addr)),
                ..Default::default()
            })
            .await
            .context("SendToRouteV2 failed")?
            .into_inner();

        if attempt.status == lnrpc::htlc_attempt::HtlcStatus::Succeeded as i32 {
            let fee = attempt
                .route
                .map(route_from_rpc)
                .map_or(route.network_fee_msat(), |r| r.network_fee_msat());
            return Ok(PaymentResult::Succeeded { fee_msat: fee });
        }
        match attempt.failure {
            Some(f) => Ok(PaymentResult::Failed(failure_from_rpc(f, route.hops.len()))),
            None => Err(anyhow!("payment attempt ended without failure attribution")),
        }
    }

    async fn query_mission_control(&self) -> anyhow::Result<Vec<NodePair>> {
        let mut client = self.inner.lock().await;
        let resp = client
            .router()
            .query_mission_control(routerrpc::QueryMissionControlRequest {})
            .await
            .context("QueryMissionControl failed")?
            .into_inner();
        Ok(resp
            .pairs
            .into_iter()
            .map(|p| NodePair {
                node_from: hex::encode(p.node_from),
                node_to: hex::encode(p.node_to),
            })
            .collect())
    }

    async fn import_mission_control(&self, pairs: &[(NodePair, i64)]) -> anyhow::Result<()> {
        let now = chrono::Utc::now().timestamp();
        let rpc_pairs = pairs
            .iter()
            .map(|(p, amt)| {
                Ok(routerrpc::PairHistory {
                    node_from: hex::decode(&p.node_from).context("bad node_from pubkey")?,
                    node_to: hex::decode(&p.node_to).context("bad node_to pubkey")?,
                    history: Some(routerrpc::PairData {
                        fail_time: now,
                        fail_amt_msat: *amt,
                        ..Default::default()
                    }),
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        let mut client = self.inner.lock().await;
        client
            .router()
            .x_import_mission_control(routerrpc::XImportMissionControlRequest {
                pairs: rpc_pairs,
                force: false,
            })
            .await
            .context("XImportMissionControl failed")?;
        Ok(())
    }
}
