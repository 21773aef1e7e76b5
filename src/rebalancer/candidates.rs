use anyhow::bail;
use rand::seq::SliceRandom;

use crate::client::LndClient;
use crate::rebalancer::{pair_key, Rebalancer};
use crate::types::Channel;

impl<C: LndClient> Rebalancer<C> {
    /// Partition the channel list into source and target candidates.
    ///
    /// A channel is a source when its remote side holds less than
    /// `100 - pfrom` percent of capacity (it has local balance to give), and
    /// a target when its local side holds less than `100 - pto` percent (it
    /// needs more local balance). Inactive channels and anything matched by
    /// the exclusion filters are dropped; non-empty inclusion sets restrict
    /// each side to the listed channels.
    pub(crate) fn get_channel_candidates(&mut self, pfrom: i64, pto: i64) -> anyhow::Result<()> {
        self.from_channels.clear();
        self.to_channels.clear();
        for c in &self.channels {
            if !c.active || c.capacity == 0 {
                continue;
            }
            if self.exclude_both.contains(&c.chan_id) {
                continue;
            }
            if self.exclude_nodes.iter().any(|n| *n == c.remote_pubkey) {
                continue;
            }
            if !self.exclude_out.contains(&c.chan_id)
                && (self.from_chan_ids.is_empty() || self.from_chan_ids.contains(&c.chan_id))
                && c.remote_balance * 100 < c.capacity * (100 - pfrom)
            {
                self.from_channels.push(c.clone());
            }
            if !self.exclude_in.contains(&c.chan_id)
                && (self.to_chan_ids.is_empty() || self.to_chan_ids.contains(&c.chan_id))
                && c.local_balance * 100 < c.capacity * (100 - pto)
            {
                self.to_channels.push(c.clone());
            }
        }
        Ok(())
    }

    /// Pick a workable (source, target, amount) triple.
    ///
    /// The working pair map is lazily rebuilt from the candidate sets minus
    /// pairs with an unexpired failure entry, then traversed in random order
    /// so repeated sessions do not hammer the same unlucky pair.
    pub(crate) fn pick_channel_pair(
        &mut self,
        amount: i64,
        min_amount: i64,
        rel_from: f64,
        rel_to: f64,
    ) -> anyhow::Result<(u64, u64, i64)> {
        self.failure_cache.retain(|_, f| !f.expired());

        if self.channel_pairs.is_empty() {
            for from in &self.from_channels {
                for to in &self.to_channels {
                    if from.chan_id == to.chan_id {
                        continue;
                    }
                    let key = pair_key(from.chan_id, to.chan_id);
                    if self.failure_cache.contains_key(&key) {
                        continue;
                    }
                    self.channel_pairs.insert(key, (from.clone(), to.clone()));
                }
            }
            if self.channel_pairs.is_empty() {
                bail!("no more channel pairs to try");
            }
        }

        let mut pairs: Vec<(Channel, Channel)> = self.channel_pairs.values().cloned().collect();
        pairs.shuffle(&mut rand::thread_rng());

        for (from, to) in &pairs {
            let amt = chosen_amount(from, to, amount, rel_from, rel_to);
            if amt <= 0 || amt <= min_amount {
                continue;
            }
            return Ok((from.chan_id, to.chan_id, amt));
        }
        bail!("no candidate channel pairs with a workable amount")
    }
}

/// Resolve the amount mode for one pair: a fixed amount wins, otherwise the
/// relative modes derive it from the balance the target is missing or the
/// balance the source has to spare.
fn chosen_amount(from: &Channel, to: &Channel, amount: i64, rel_from: f64, rel_to: f64) -> i64 {
    if amount > 0 {
        amount
    } else if rel_to > 0.0 {
        (to.capacity as f64 * rel_to) as i64 - to.local_balance
    } else if rel_from > 0.0 {
        from.local_balance - (from.capacity as f64 * (1.0 - rel_from)) as i64
    } else {
        0
    }
}
