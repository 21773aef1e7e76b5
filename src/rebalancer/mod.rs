pub mod candidates;
pub mod payment;
pub mod rapid;
pub mod routes;
pub mod session;
#[cfg(test)]
pub(crate) mod testutil;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::bail;
use log::info;
use tokio::time::Instant;

use crate::client::LndClient;
use crate::config::Config;
use crate::deadline::Deadline;
use crate::node_cache::SharedNodeCache;
use crate::scid;
use crate::types::{Channel, ChannelEdge, Invoice, NodePair};

/// How long a channel pair sits out after a failed route query.
pub(crate) const ROUTE_FAILURE_TTL: Duration = Duration::from_secs(60);
/// How long a channel pair sits out after a failed payment.
pub(crate) const PAYMENT_FAILURE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub(crate) struct FailedRoute {
    pub expires_at: Instant,
}

impl FailedRoute {
    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

pub(crate) fn pair_key(from: u64, to: u64) -> String {
    format!("{}-{}", from, to)
}

/// The rebalancing engine: one instance per session, driven by a single
/// worker. Holds the channel working sets and all caches.
pub struct Rebalancer<C: LndClient> {
    pub(crate) client: C,
    pub(crate) config: Config,
    pub(crate) my_pk: String,
    pub(crate) channels: Vec<Channel>,
    pub(crate) from_channels: Vec<Channel>,
    pub(crate) from_chan_ids: HashSet<u64>,
    pub(crate) to_channels: Vec<Channel>,
    pub(crate) to_chan_ids: HashSet<u64>,
    pub(crate) channel_pairs: HashMap<String, (Channel, Channel)>,
    pub(crate) chan_cache: HashMap<u64, ChannelEdge>,
    pub(crate) failure_cache: HashMap<String, FailedRoute>,
    pub(crate) exclude_in: HashSet<u64>,
    pub(crate) exclude_out: HashSet<u64>,
    pub(crate) exclude_both: HashSet<u64>,
    pub(crate) exclude_nodes: Vec<String>,
    pub(crate) invoice_cache: HashMap<i64, Invoice>,
    pub(crate) mc_cache: HashMap<String, i64>,
    pub(crate) failed_pairs: Vec<(NodePair, i64)>,
    pub(crate) node_cache: SharedNodeCache,
    pub(crate) successes: u32,
}

impl<C: LndClient> Rebalancer<C> {
    pub fn new(client: C, config: Config, node_cache: SharedNodeCache) -> Self {
        Self {
            client,
            config,
            my_pk: String::new(),
            channels: Vec::new(),
            from_channels: Vec::new(),
            from_chan_ids: HashSet::new(),
            to_channels: Vec::new(),
            to_chan_ids: HashSet::new(),
            channel_pairs: HashMap::new(),
            chan_cache: HashMap::new(),
            failure_cache: HashMap::new(),
            exclude_in: HashSet::new(),
            exclude_out: HashSet::new(),
            exclude_both: HashSet::new(),
            exclude_nodes: Vec::new(),
            invoice_cache: HashMap::new(),
            mc_cache: HashMap::new(),
            failed_pairs: Vec::new(),
            node_cache,
            successes: 0,
        }
    }

    pub fn successes(&self) -> u32 {
        self.successes
    }

    /// Startup sequence: resolve our identity, list channels, expand the
    /// inclusion and exclusion filters, derive the initial candidate sets,
    /// and warm the mission-control cache. Any error here is fatal.
    pub async fn startup(&mut self, info: &Deadline) -> anyhow::Result<()> {
        self.my_pk = info.run(self.client.get_info()).await?;
        info!("Connected to node {}", self.my_pk);

        self.channels = info.run(self.client.list_channels(true, true, None)).await?;
        if self.channels.is_empty() {
            bail!("no active channels found");
        }

        let from_filter = std::mem::take(&mut self.config.from);
        self.from_chan_ids = self.expand_filter(info, &from_filter).await?;
        let to_filter = std::mem::take(&mut self.config.to);
        self.to_chan_ids = self.expand_filter(info, &to_filter).await?;

        self.exclude_in = scid::split_channel_node_ids(&self.config.exclude_channels_in)?.0;
        self.exclude_out = scid::split_channel_node_ids(&self.config.exclude_channels_out)?.0;
        self.exclude_both = scid::split_channel_node_ids(&self.config.exclude_channels)?.0;
        self.exclude_nodes = self
            .config
            .exclude_nodes
            .iter()
            .map(|n| n.to_lowercase())
            .collect();
        if !self.config.exclude.is_empty() {
            let (chans, nodes) = scid::split_channel_node_ids(&self.config.exclude)?;
            self.exclude_both = chans;
            self.exclude_nodes = nodes;
        }

        let (pfrom, pto) = (self.config.pfrom, self.config.pto);
        self.get_channel_candidates(pfrom, pto)?;
        if self.from_channels.is_empty() {
            bail!("No source channels selected");
        }
        if self.to_channels.is_empty() {
            bail!("No target channels selected");
        }
        info!(
            "{} source and {} target channels selected",
            self.from_channels.len(),
            self.to_channels.len()
        );

        self.warm_mission_control(info).await;
        Ok(())
    }

    /// Expand a mixed channel/node filter list: node pubkeys resolve to all
    /// of that peer's active channels.
    async fn expand_filter(
        &mut self,
        deadline: &Deadline,
        items: &[String],
    ) -> anyhow::Result<HashSet<u64>> {
        let (mut chans, nodes) = scid::split_channel_node_ids(items)?;
        for node in &nodes {
            let peer_channels = deadline
                .run(self.client.list_channels(true, true, Some(node.as_str())))
                .await?;
            chans.extend(peer_channels.iter().map(|c| c.chan_id));
        }
        Ok(chans)
    }
}
