use std::collections::HashSet;

use anyhow::{bail, Context};

/// Parse a channel id given either as a decimal 64-bit integer or in short
/// channel id form `BLOCKxTXxOUT`. The short form is detected by the presence
/// of exactly two `x` separators.
pub fn parse_channel_id(s: &str) -> anyhow::Result<u64> {
    if let Ok(id) = s.parse::<u64>() {
        return Ok(id);
    }
    let lower = s.to_lowercase();
    if lower.matches('x').count() == 2 {
        return parse_scid(&lower);
    }
    bail!("cannot parse channel id {:?}", s)
}

fn parse_scid(s: &str) -> anyhow::Result<u64> {
    let mut parts = s.split('x');
    let block: u64 = parts
        .next()
        .unwrap()
        .parse()
        .with_context(|| format!("bad block height in scid {:?}", s))?;
    let tx: u64 = parts
        .next()
        .unwrap()
        .parse()
        .with_context(|| format!("bad tx index in scid {:?}", s))?;
    let out: u64 = parts
        .next()
        .unwrap()
        .parse()
        .with_context(|| format!("bad output index in scid {:?}", s))?;
    if block >= 1 << 24 || tx >= 1 << 24 || out >= 1 << 16 {
        bail!("scid component out of range in {:?}", s);
    }
    Ok(block << 40 | tx << 16 | out)
}

/// Format a channel id in short channel id form.
pub fn format_scid(chan_id: u64) -> String {
    format!(
        "{}x{}x{}",
        chan_id >> 40,
        chan_id >> 16 & 0xFFFFFF,
        chan_id & 0xFFFF
    )
}

fn is_node_pubkey(s: &str) -> bool {
    s.len() == 66
        && (s.starts_with("02") || s.starts_with("03"))
        && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Split a mixed list of channel ids and node public keys, as accepted by the
/// `from`, `to` and `exclude` options. Node keys are returned verbatim for
/// later expansion into per-peer channel lists.
pub fn split_channel_node_ids(
    items: &[String],
) -> anyhow::Result<(HashSet<u64>, Vec<String>)> {
    let mut chans = HashSet::new();
    let mut nodes = Vec::new();
    for item in items {
        if is_node_pubkey(item) {
            nodes.push(item.to_lowercase());
        } else {
            chans.insert(parse_channel_id(item)?);
        }
    }
    Ok((chans, nodes))
}
