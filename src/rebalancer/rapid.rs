use std::collections::HashSet;
use std::time::Duration;

use log::info;

use crate::client::LndClient;
use crate::deadline::Deadline;
use crate::rebalancer::Rebalancer;
use crate::types::Route;

impl<C: LndClient> Rebalancer<C> {
    /// Repeat a just-succeeded route while both endpoints keep qualifying.
    ///
    /// Every iteration refreshes the two peers' channel lists, resets the
    /// working state, re-derives the candidate sets restricted to the known
    /// pair, and rebuilds the route at the freshly computed amount. The
    /// loop ends when either channel falls out of eligibility, a payment
    /// fails, or the attempt deadline trips. Returns the number of
    /// successful iterations.
    pub(crate) async fn try_rapid_rebalance(
        &mut self,
        session: &Deadline,
        mut from: u64,
        mut to: u64,
        route: &Route,
        mut amount: i64,
    ) -> anyhow::Result<u32> {
        let mut route = route.clone();
        let mut rapid_attempt: u32 = 0;

        loop {
            info!("Rapid rebalance attempt {}", rapid_attempt + 1);

            let c_from = self.get_chan_info(session, from).await?;
            let (from_peer, _) = c_from.peer_side(&self.my_pk)?;
            let from_peer = from_peer.to_string();
            let c_to = self.get_chan_info(session, to).await?;
            let (to_peer, _) = c_to.peer_side(&self.my_pk)?;
            let to_peer = to_peer.to_string();

            let from_chans = session
                .run(self.client.list_channels(true, true, Some(from_peer.as_str())))
                .await?;
            let to_chans = session
                .run(self.client.list_channels(true, true, Some(to_peer.as_str())))
                .await?;

            self.from_chan_ids = HashSet::from([from]);
            self.to_chan_ids = HashSet::from([to]);
            self.channels.clear();
            self.channels.extend(to_chans);
            self.channels.extend(from_chans);
            self.failure_cache.clear();
            self.channel_pairs.clear();

            let (pfrom, pto) = (self.config.pfrom, self.config.pto);
            self.get_channel_candidates(pfrom, pto)?;

            let picked = self.pick_channel_pair(
                amount,
                self.config.min_amount,
                self.config.rel_amount_from,
                self.config.rel_amount_to,
            );
            let (f, t, a) = match picked {
                Ok(v) => v,
                Err(e) => {
                    info!("Rapid rebalance finished: {}", e);
                    break;
                }
            };
            from = f;
            to = t;
            amount = a;

            route = self.rebuild_route(session, &route, amount).await?;

            let attempt =
                session.child(Duration::from_secs(self.config.timeout_attempt * 60));
            match self.pay(&attempt, amount, self.config.min_amount, &route, 0).await {
                Ok(()) => rapid_attempt += 1,
                Err(e) => {
                    if attempt.expired() {
                        info!("Rapid rebalance attempt timed out");
                        return Err(e);
                    }
                    info!("Rapid rebalance stopped: {:#}", e);
                    break;
                }
            }
        }
        info!("{} rapid rebalances were successful", rapid_attempt);
        Ok(rapid_attempt)
    }
}
