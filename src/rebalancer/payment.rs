use anyhow::{anyhow, bail};
use log::{info, warn};
use rand::RngCore;
use thiserror::Error;

use crate::client::LndClient;
use crate::deadline::Deadline;
use crate::rebalancer::{Rebalancer, PAYMENT_FAILURE_TTL};
use crate::stats;
use crate::types::{FailureCode, Invoice, PaymentResult, Route};

/// Typed outcome carried from the executor back to the orchestrator when
/// probing found a smaller amount worth retrying. Matched by downcast.
#[derive(Debug, Error)]
pub enum PayError {
    #[error("retry the rebalance with {amount} sat")]
    Retry { amount: i64 },
}

fn fake_payment_hash() -> Vec<u8> {
    let mut hash = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut hash);
    hash
}

impl<C: LndClient> Rebalancer<C> {
    /// Dispatch a payment of `amount` sat along `route`.
    ///
    /// On success the stats CSV gets a row and the success counter advances.
    /// A failure before the last hop marks the channel pair failed. A
    /// liquidity failure at the last hop hands off to the prober when
    /// `probe_steps` allows, surfacing the probed amount as
    /// [`PayError::Retry`] unless it sits within the fail tolerance of the
    /// amount that just failed.
    pub(crate) async fn pay(
        &mut self,
        deadline: &Deadline,
        amount: i64,
        min_amount: i64,
        route: &Route,
        probe_steps: u32,
    ) -> anyhow::Result<()> {
        let from_chan = route.hops.first().map_or(0, |h| h.chan_id);
        let to_chan = route.hops.last().map_or(0, |h| h.chan_id);
        let invoice = self.create_invoice(deadline, amount).await?;

        let result = deadline
            .run(self.client.send_to_route(
                &invoice.payment_hash,
                Some(invoice.payment_addr.as_slice()),
                route,
            ))
            .await?;

        match result {
            PaymentResult::Succeeded { fee_msat } => {
                self.successes += 1;
                info!(
                    "Rebalanced {} sat from {} to {} for {} msat in fees",
                    amount, from_chan, to_chan, fee_msat
                );
                if let Err(e) = stats::record_success(
                    &self.config.stat,
                    amount,
                    fee_msat,
                    from_chan,
                    to_chan,
                    route.hops.len(),
                ) {
                    warn!("Failed to record stats: {:#}", e);
                }
                Ok(())
            }
            PaymentResult::Failed(f) => {
                self.record_failed_pair(route, f.hop_index);
                let last_index = route.hops.len().saturating_sub(1);

                if f.hop_index == last_index
                    && f.code == FailureCode::TemporaryChannelFailure
                    && probe_steps > 0
                {
                    let probed = self
                        .probe_route(deadline, route, amount, min_amount, probe_steps)
                        .await?;
                    if (amount - probed).abs() * 1_000_000 / amount < self.config.fail_tolerance
                    {
                        self.add_failed_route(from_chan, to_chan, PAYMENT_FAILURE_TTL);
                        bail!(
                            "probed amount {} is within the fail tolerance of {}",
                            probed,
                            amount
                        );
                    }
                    return Err(PayError::Retry { amount: probed }.into());
                }

                if f.hop_index == last_index && f.code == FailureCode::IncorrectPaymentDetails {
                    // The invoice itself was rejected; never reuse it.
                    self.invalidate_invoice(amount);
                }
                self.add_failed_route(from_chan, to_chan, PAYMENT_FAILURE_TTL);
                bail!("payment failed at hop {} ({:?})", f.hop_index, f.code)
            }
        }
    }

    /// Bisect between `min_amount` and the failed amount for the largest
    /// deliverable amount on this route. Probe payments carry a random
    /// payment hash: an unknown-invoice rejection from the destination
    /// proves the liquidity was there, a temporary channel failure proves
    /// it was not.
    pub(crate) async fn probe_route(
        &mut self,
        deadline: &Deadline,
        route: &Route,
        failed_amount: i64,
        min_amount: i64,
        steps: u32,
    ) -> anyhow::Result<i64> {
        let mut lo = min_amount.max(0);
        let mut hi = failed_amount;
        let mut best: Option<i64> = None;
        let tolerance_sat = failed_amount * self.config.fail_tolerance / 1_000_000;

        for _ in 0..steps {
            if hi - lo <= tolerance_sat {
                break;
            }
            let mid = (lo + hi) / 2;
            if mid <= 0 || mid < min_amount {
                break;
            }
            let probe = self.rebuild_route(deadline, route, mid).await?;
            info!("Probing amount {}", mid);
            let result = deadline
                .run(self.client.send_to_route(&fake_payment_hash(), None, &probe))
                .await?;
            let last_index = probe.hops.len().saturating_sub(1);
            match result {
                PaymentResult::Failed(f)
                    if f.code == FailureCode::IncorrectPaymentDetails
                        && f.hop_index == last_index =>
                {
                    best = Some(mid);
                    lo = mid;
                }
                PaymentResult::Failed(f)
                    if f.code == FailureCode::TemporaryChannelFailure =>
                {
                    hi = mid;
                }
                PaymentResult::Failed(f) => {
                    self.record_failed_pair(&probe, f.hop_index);
                    bail!("probe failed at hop {} ({:?})", f.hop_index, f.code);
                }
                PaymentResult::Succeeded { .. } => {
                    bail!("probe payment settled unexpectedly");
                }
            }
        }
        best.ok_or_else(|| {
            anyhow!(
                "probing exhausted without a workable amount above {}",
                min_amount
            )
        })
    }

    /// Invoices are minted once per amount and reused across retries.
    pub(crate) async fn create_invoice(
        &mut self,
        deadline: &Deadline,
        amount: i64,
    ) -> anyhow::Result<Invoice> {
        if let Some(invoice) = self.invoice_cache.get(&amount) {
            return Ok(invoice.clone());
        }
        let invoice = deadline
            .run(
                self.client
                    .add_invoice(amount, &format!("rebalance {} sat", amount)),
            )
            .await?;
        self.invoice_cache.insert(amount, invoice.clone());
        Ok(invoice)
    }

    pub(crate) fn invalidate_invoice(&mut self, amount: i64) {
        self.invoice_cache.remove(&amount);
    }
}
