use std::time::Duration;

use anyhow::bail;
use log::{error, info, warn};

use crate::client::LndClient;
use crate::deadline::{Deadline, DeadlineExceeded};
use crate::rebalancer::payment::PayError;
use crate::rebalancer::{Rebalancer, ROUTE_FAILURE_TTL};

impl<C: LndClient> Rebalancer<C> {
    /// The top-level session loop. Runs attempts until one succeeds, the
    /// candidate pairs are exhausted, or the session deadline trips (an
    /// error, so the caller can translate it into the exit code).
    pub async fn run_session(&mut self) -> anyhow::Result<()> {
        let session = Deadline::after(Duration::from_secs(
            self.config.timeout_rebalance * 60,
        ));
        let mut attempt: u32 = 1;
        loop {
            let retry = self.try_rebalance(&session, &mut attempt).await;
            if session.expired() {
                error!("Rebalancing timed out");
                bail!("rebalancing timed out");
            }
            if !retry {
                return Ok(());
            }
        }
    }

    /// One pick -> route -> pay cycle under a fresh attempt deadline.
    /// Returns whether the session loop should try again.
    async fn try_rebalance(&mut self, session: &Deadline, attempt: &mut u32) -> bool {
        let attempt_deadline =
            session.child(Duration::from_secs(self.config.timeout_attempt * 60));

        let picked = self.pick_channel_pair(
            self.config.amount,
            self.config.min_amount,
            self.config.rel_amount_from,
            self.config.rel_amount_to,
        );
        let (from, to, mut amt) = match picked {
            Ok(v) => v,
            Err(e) => {
                error!("Error during picking channel: {:#}", e);
                return false;
            }
        };

        let route_deadline =
            attempt_deadline.child(Duration::from_secs(self.config.timeout_route));
        let (routes, fee_limit) = match self
            .get_routes(&route_deadline, from, to, amt * 1000)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                if e.is::<DeadlineExceeded>() {
                    error!("Timed out looking for a route");
                } else {
                    self.add_failed_route(from, to, ROUTE_FAILURE_TTL);
                    warn!("Error looking for a route: {:#}", e);
                }
                return true;
            }
        };
        if routes.is_empty() {
            self.add_failed_route(from, to, ROUTE_FAILURE_TTL);
            warn!("No routes found between {} and {}", from, to);
            return true;
        }

        for route in &routes {
            info!(
                "Attempt #{}, amount: {} (max fee: {} msat | {} ppm)",
                attempt,
                amt,
                fee_limit,
                if amt > 0 { fee_limit * 1000 / amt } else { 0 }
            );
            self.log_route(&attempt_deadline, route).await;

            match self
                .pay(
                    &attempt_deadline,
                    amt,
                    self.config.min_amount,
                    route,
                    self.config.probe_steps,
                )
                .await
            {
                Ok(()) => {
                    if self.config.allow_rapid_rebalance {
                        self.run_rapid(session, from, to, route, amt).await;
                    }
                    return false;
                }
                Err(e) => {
                    if let Some(PayError::Retry { amount }) = e.downcast_ref::<PayError>() {
                        amt = *amount;
                        info!("Trying to rebalance again with {} sat", amt);
                        match self.rebuild_route(&attempt_deadline, route, amt).await {
                            Err(e) => {
                                warn!(
                                    "Error rebuilding the route for the probed amount: {:#}",
                                    e
                                );
                            }
                            Ok(probed_route) => {
                                // The probed retry runs under the session
                                // deadline; the attempt may be nearly spent.
                                match self.pay(session, amt, 0, &probed_route, 0).await {
                                    Ok(()) => {
                                        if self.config.allow_rapid_rebalance
                                            && self.config.min_amount > 0
                                        {
                                            self.run_rapid(
                                                session,
                                                from,
                                                to,
                                                &probed_route,
                                                amt,
                                            )
                                            .await;
                                        }
                                        return false;
                                    }
                                    Err(e) => {
                                        self.invalidate_invoice(amt);
                                        warn!(
                                            "Probed rebalance failed with error: {:#}",
                                            e
                                        );
                                    }
                                }
                            }
                        }
                    } else if !e.is::<DeadlineExceeded>() {
                        warn!("Payment failed: {:#}", e);
                    }
                }
            }
            *attempt += 1;
            if attempt_deadline.expired() {
                break;
            }
        }
        if attempt_deadline.expired() {
            error!("Attempt timed out");
        }
        true
    }

    async fn run_rapid(
        &mut self,
        session: &Deadline,
        from: u64,
        to: u64,
        route: &crate::types::Route,
        amt: i64,
    ) {
        match self.try_rapid_rebalance(session, from, to, route, amt).await {
            Ok(n) => info!("Finished rapid rebalancing, {} iterations", n),
            Err(e) => warn!("Rapid rebalance failed with {:#}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rebalancer::testutil::{base_config, scenario_engine, ME, PEER_B};

    // -----------------------------------------------------------------------
    // Basic rebalance: pair (A -> B) picked, fee ceiling 51_000 msat, route
    // query constrained accordingly, one successful payment.
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_session_basic_rebalance() {
        let mut r = scenario_engine(base_config());
        let (pfrom, pto) = (r.config.pfrom, r.config.pto);
        r.get_channel_candidates(pfrom, pto).unwrap();

        r.run_session().await.unwrap();

        assert_eq!(r.successes(), 1);
        let calls = r.client.query_routes_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].outgoing_chan_id, 101);
        assert_eq!(calls[0].last_hop_pubkey, PEER_B);
        assert_eq!(calls[0].fee_limit_msat, 51_000);
        assert_eq!(calls[0].pub_key, ME);
    }

    // -----------------------------------------------------------------------
    // A probed rebalance: the full amount fails on the last hop, probing
    // finds 55k, and the probed retry settles.
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_session_probed_rebalance_settles() {
        let mut config = base_config();
        config.min_amount = 10_000;
        config.probe_steps = 4;
        let mut r = scenario_engine(config);
        *r.client.liquidity_cap_msat.lock().unwrap() = Some(60_000_000);
        let (pfrom, pto) = (r.config.pfrom, r.config.pto);
        r.get_channel_candidates(pfrom, pto).unwrap();

        r.run_session().await.unwrap();

        assert_eq!(r.successes(), 1);
        // Two invoices: the failed 100k and the probed 55k
        let invoices = r.client.invoices_issued.lock().unwrap();
        assert_eq!(invoices.len(), 2);
        let sent = r.client.sent_routes.lock().unwrap();
        let settled = sent.last().unwrap();
        assert_eq!(settled.1.hops.last().unwrap().amt_to_forward_msat, 55_000_000);
    }

    // -----------------------------------------------------------------------
    // Rapid rebalance drains the pair until neither side qualifies.
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_session_rapid_rebalance_terminates() {
        let mut config = base_config();
        config.allow_rapid_rebalance = true;
        let mut r = scenario_engine(config);
        r.client.settle_payments = true;
        let (pfrom, pto) = (r.config.pfrom, r.config.pto);
        r.get_channel_candidates(pfrom, pto).unwrap();

        r.run_session().await.unwrap();

        // Initial payment plus three rapid iterations
        assert_eq!(r.successes(), 4);
        let channels = r.client.channels.lock().unwrap();
        let a = channels.iter().find(|c| c.chan_id == 101).unwrap();
        assert!(a.remote_balance * 100 >= a.capacity * 50);
    }

    // -----------------------------------------------------------------------
    // Session timeout: route queries hang past the route deadline and the
    // session gives up at its own deadline with an error.
    // -----------------------------------------------------------------------
    #[tokio::test(start_paused = true)]
    async fn test_session_times_out() {
        let mut config = base_config();
        config.timeout_rebalance = 1;
        let mut r = scenario_engine(config);
        r.client.route_delay = Some(Duration::from_secs(120));
        let (pfrom, pto) = (r.config.pfrom, r.config.pto);
        r.get_channel_candidates(pfrom, pto).unwrap();

        let err = r.run_session().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert_eq!(r.successes(), 0);
        // The same unviable pair was retried until the session expired
        assert!(r.client.query_routes_calls.lock().unwrap().len() >= 2);
    }

    // -----------------------------------------------------------------------
    // Pair exhaustion stops the session without a success.
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_session_stops_on_no_candidates() {
        let mut r = scenario_engine(base_config());
        // Candidate derivation never ran: no pairs exist
        r.run_session().await.unwrap();
        assert_eq!(r.successes(), 0);
    }

    // -----------------------------------------------------------------------
    // Startup wiring: exclusion empties the target set fatally, node
    // filters expand to the peer's channels, mission control is primed.
    // -----------------------------------------------------------------------
    #[tokio::test]
    async fn test_startup_exclusion_is_fatal() {
        let mut config = base_config();
        config.exclude = vec!["202".to_string()];
        let mut r = scenario_engine(config);
        let err = r
            .startup(&crate::rebalancer::testutil::deadline())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No target channels selected"));
    }

    #[tokio::test]
    async fn test_startup_expands_node_filters() {
        let mut config = base_config();
        config.from = vec![crate::rebalancer::testutil::PEER_A.to_string()];
        let mut r = scenario_engine(config);
        r.startup(&crate::rebalancer::testutil::deadline())
            .await
            .unwrap();
        assert!(r.from_chan_ids.contains(&101));
        assert_eq!(r.from_channels.len(), 1);
    }

    #[tokio::test]
    async fn test_startup_primes_mission_control() {
        let mut r = scenario_engine(base_config());
        r.client.mc_pairs = vec![crate::types::NodePair {
            node_from: crate::rebalancer::testutil::PEER_A.to_string(),
            node_to: PEER_B.to_string(),
        }];
        r.startup(&crate::rebalancer::testutil::deadline())
            .await
            .unwrap();
        assert_eq!(r.mc_cache.len(), 1);
    }
}
