use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::Parser;
use log::info;
use serde::{Deserialize, Serialize};

/// Runtime options, sourced from a TOML or JSON config file with CLI flags
/// layered on top. Zero/empty means "unset"; `preflight` fills defaults and
/// rejects inconsistent combinations.
#[derive(Parser, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[command(name = "lnbalancer", about = "Circular rebalancing tool for LND nodes")]
pub struct Config {
    /// Config file path (TOML or JSON, detected by extension)
    #[arg(short = 'f', long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Connect to lnd using host:port
    #[arg(short = 'c', long, default_value = "")]
    #[serde(default)]
    pub connect: String,

    /// Path to tls.cert to connect
    #[arg(short = 't', long, default_value = "")]
    #[serde(default)]
    pub tlscert: String,

    /// Path to the macaroon directory
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub macaroon_dir: String,

    /// Macaroon filename
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub macaroon_filename: String,

    /// Bitcoin network to use
    #[arg(short = 'n', long, default_value = "")]
    #[serde(default)]
    pub network: String,

    /// Channels with at least this remote liquidity percentage are
    /// considered source channels
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub pfrom: i64,

    /// Channels missing at least this local liquidity percentage are
    /// considered target channels
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub pto: i64,

    /// Use this value as both pfrom and pto
    #[arg(short = 'p', long, default_value_t = 0)]
    #[serde(default)]
    pub perc: i64,

    /// Amount to rebalance, in satoshis
    #[arg(short = 'a', long, default_value_t = 0)]
    #[serde(default)]
    pub amount: i64,

    /// Calculate amount as a fraction of the target channel's capacity
    #[arg(long, default_value_t = 0.0)]
    #[serde(default)]
    pub rel_amount_to: f64,

    /// Calculate amount as a fraction of the source channel's capacity
    #[arg(long, default_value_t = 0.0)]
    #[serde(default)]
    pub rel_amount_from: f64,

    /// Economical ratio for fee limit calculation as a multiple of the
    /// target channel's fee
    #[arg(short = 'r', long, default_value_t = 0.0)]
    #[serde(default)]
    pub econ_ratio: f64,

    /// Limit the max fee ppm when using econ ratio
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub econ_ratio_max_ppm: i64,

    /// Ignore the target channel fee and use this max fee ppm instead
    #[arg(short = 'F', long, default_value_t = 0)]
    #[serde(default)]
    pub fee_limit_ppm: i64,

    /// Also subtract the source channel fee when computing the fee limit
    #[arg(short = 'l', long)]
    #[serde(default)]
    pub lost_profit: bool,

    /// On last-hop failure, probe lower amounts using this many steps
    #[arg(short = 'b', long, default_value_t = 0)]
    #[serde(default)]
    pub probe_steps: u32,

    /// Reuse a successful route for further rebalances until the channel
    /// criteria no longer hold
    #[arg(long)]
    #[serde(default)]
    pub allow_rapid_rebalance: bool,

    /// Minimum amount to try when probing
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub min_amount: i64,

    /// Don't use this channel as incoming (repeatable)
    #[arg(short = 'i', long = "exclude-channel-in")]
    #[serde(default)]
    pub exclude_channels_in: Vec<String>,

    /// Don't use this channel as outgoing (repeatable)
    #[arg(short = 'o', long = "exclude-channel-out")]
    #[serde(default)]
    pub exclude_channels_out: Vec<String>,

    /// (DEPRECATED) don't use this channel at all (repeatable)
    #[arg(short = 'e', long = "exclude-channel")]
    #[serde(default)]
    pub exclude_channels: Vec<String>,

    /// (DEPRECATED) don't use this node for routing (repeatable)
    #[arg(short = 'd', long = "exclude-node")]
    #[serde(default)]
    pub exclude_nodes: Vec<String>,

    /// Don't use this node or channel for routing (repeatable)
    #[arg(long)]
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Try only this channel or node as target (repeatable)
    #[arg(long)]
    #[serde(default)]
    pub to: Vec<String>,

    /// Try only this channel or node as source (repeatable)
    #[arg(long)]
    #[serde(default)]
    pub from: Vec<String>,

    /// Cancel a probed payment differing from the prior attempt by less
    /// than this many ppm
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub fail_tolerance: i64,

    /// (DEPRECATED, always on) let the source channel go below 50% local
    #[arg(long)]
    #[serde(default)]
    pub allow_unbalance_from: bool,

    /// (DEPRECATED, always on) let the target channel go above 50% local
    #[arg(long)]
    #[serde(default)]
    pub allow_unbalance_to: bool,

    /// Save successful rebalance information to this CSV file
    #[arg(short = 's', long, default_value = "")]
    #[serde(default)]
    pub stat: String,

    /// Save and load node information to this file
    #[arg(long, default_value = "")]
    #[serde(default)]
    pub node_cache_filename: String,

    /// Discard cached nodes older than this many minutes on load
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub node_cache_lifetime: i64,

    /// Mark node cache hits and misses when printing routes
    #[arg(long)]
    #[serde(default)]
    pub node_cache_info: bool,

    /// Max rebalance session time in minutes
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub timeout_rebalance: u64,

    /// Max attempt time in minutes
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub timeout_attempt: u64,

    /// Max general info query time in seconds
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub timeout_info: u64,

    /// Max route query time in seconds
    #[arg(long, default_value_t = 0)]
    #[serde(default)]
    pub timeout_route: u64,

    /// Show program version and exit
    #[arg(short = 'v', long)]
    #[serde(default)]
    pub version: bool,
}

impl Config {
    /// Load a config file, detecting the format by extension.
    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config = if path.extension().map_or(false, |e| e == "toml") {
            toml::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?
        };
        Ok(config)
    }

    /// Layer explicitly-set CLI values over file values. Zero/empty CLI
    /// values leave the file value in place.
    pub fn merge(file: Config, cli: Config) -> Config {
        let mut m = file;
        m.config = cli.config;
        m.version = cli.version;
        if !cli.connect.is_empty() {
            m.connect = cli.connect;
        }
        if !cli.tlscert.is_empty() {
            m.tlscert = cli.tlscert;
        }
        if !cli.macaroon_dir.is_empty() {
            m.macaroon_dir = cli.macaroon_dir;
        }
        if !cli.macaroon_filename.is_empty() {
            m.macaroon_filename = cli.macaroon_filename;
        }
        if !cli.network.is_empty() {
            m.network = cli.network;
        }
        if cli.pfrom != 0 {
            m.pfrom = cli.pfrom;
        }
        if cli.pto != 0 {
            m.pto = cli.pto;
        }
        if cli.perc != 0 {
            m.perc = cli.perc;
        }
        if cli.amount != 0 {
            m.amount = cli.amount;
        }
        if cli.rel_amount_to != 0.0 {
            m.rel_amount_to = cli.rel_amount_to;
        }
        if cli.rel_amount_from != 0.0 {
            m.rel_amount_from = cli.rel_amount_from;
        }
        if cli.econ_ratio != 0.0 {
            m.econ_ratio = cli.econ_ratio;
        }
        if cli.econ_ratio_max_ppm != 0 {
            m.econ_ratio_max_ppm = cli.econ_ratio_max_ppm;
        }
        if cli.fee_limit_ppm != 0 {
            m.fee_limit_ppm = cli.fee_limit_ppm;
        }
        m.lost_profit |= cli.lost_profit;
        if cli.probe_steps != 0 {
            m.probe_steps = cli.probe_steps;
        }
        m.allow_rapid_rebalance |= cli.allow_rapid_rebalance;
        if cli.min_amount != 0 {
            m.min_amount = cli.min_amount;
        }
        if !cli.exclude_channels_in.is_empty() {
            m.exclude_channels_in = cli.exclude_channels_in;
        }
        if !cli.exclude_channels_out.is_empty() {
            m.exclude_channels_out = cli.exclude_channels_out;
        }
        if !cli.exclude_channels.is_empty() {
            m.exclude_channels = cli.exclude_channels;
        }
        if !cli.exclude_nodes.is_empty() {
            m.exclude_nodes = cli.exclude_nodes;
        }
        if !cli.exclude.is_empty() {
            m.exclude = cli.exclude;
        }
        if !cli.to.is_empty() {
            m.to = cli.to;
        }
        if !cli.from.is_empty() {
            m.from = cli.from;
        }
        if cli.fail_tolerance != 0 {
            m.fail_tolerance = cli.fail_tolerance;
        }
        m.allow_unbalance_from |= cli.allow_unbalance_from;
        m.allow_unbalance_to |= cli.allow_unbalance_to;
        if !cli.stat.is_empty() {
            m.stat = cli.stat;
        }
        if !cli.node_cache_filename.is_empty() {
            m.node_cache_filename = cli.node_cache_filename;
        }
        if cli.node_cache_lifetime != 0 {
            m.node_cache_lifetime = cli.node_cache_lifetime;
        }
        m.node_cache_info |= cli.node_cache_info;
        if cli.timeout_rebalance != 0 {
            m.timeout_rebalance = cli.timeout_rebalance;
        }
        if cli.timeout_attempt != 0 {
            m.timeout_attempt = cli.timeout_attempt;
        }
        if cli.timeout_info != 0 {
            m.timeout_info = cli.timeout_info;
        }
        if cli.timeout_route != 0 {
            m.timeout_route = cli.timeout_route;
        }
        m
    }

    /// Apply defaults and validate flag combinations. Errors here are fatal
    /// startup conditions.
    pub fn preflight(&mut self) -> anyhow::Result<()> {
        if self.connect.is_empty() {
            self.connect = "127.0.0.1:10009".to_string();
        }
        if self.macaroon_filename.is_empty() {
            self.macaroon_filename = "admin.macaroon".to_string();
        }
        if self.network.is_empty() {
            self.network = "mainnet".to_string();
        }
        if self.pfrom == 0 {
            self.pfrom = 50;
        }
        if self.pto == 0 {
            self.pto = 50;
        }
        if self.econ_ratio == 0.0 && self.fee_limit_ppm == 0 {
            self.econ_ratio = 1.0;
        }
        if self.econ_ratio_max_ppm != 0 && self.fee_limit_ppm != 0 {
            bail!("use either econ-ratio-max-ppm or fee-limit-ppm but not both");
        }
        if self.perc > 0 {
            self.pfrom = self.perc;
            self.pto = self.perc;
        }
        if self.min_amount > 0 && self.amount > 0 && self.min_amount > self.amount {
            bail!("minimum amount should be less than amount");
        }
        if self.amount > 0 && (self.rel_amount_from > 0.0 || self.rel_amount_to > 0.0) {
            bail!("use either precise amount or relative amounts but not both");
        }
        if self.amount == 0 && self.rel_amount_from == 0.0 && self.rel_amount_to == 0.0 {
            bail!("no amount specified, use either --amount, --rel-amount-from, or --rel-amount-to");
        }
        if self.fail_tolerance == 0 {
            self.fail_tolerance = 1000;
        }
        if (self.rel_amount_from > 0.0 || self.rel_amount_to > 0.0) && self.allow_rapid_rebalance
        {
            bail!("use either relative amounts or rapid rebalance but not both");
        }
        if self.probe_steps > 0 && self.min_amount <= 0 {
            bail!("min-amount is required when probing is enabled");
        }
        if self.node_cache_lifetime == 0 {
            self.node_cache_lifetime = 1440;
        }
        if !self.exclude_channels.is_empty() || !self.exclude_nodes.is_empty() {
            info!(
                "--exclude-channel and --exclude-node are deprecated, use --exclude instead \
                 for both channels and nodes"
            );
            if !self.exclude.is_empty() {
                bail!(
                    "can't use --exclude and --exclude-channel/--exclude-node (or config \
                     parameters) at the same time"
                );
            }
        }
        if self.allow_unbalance_from || self.allow_unbalance_to {
            info!(
                "--allow-unbalance-from/to are deprecated and enabled by default, please \
                 remove them from your config or command line parameters"
            );
        }
        if self.timeout_attempt == 0 {
            self.timeout_attempt = 5;
        }
        if self.timeout_rebalance == 0 {
            self.timeout_rebalance = 360;
        }
        if self.timeout_info == 0 {
            self.timeout_info = 30;
        }
        if self.timeout_route == 0 {
            self.timeout_route = 30;
        }
        Ok(())
    }
}
