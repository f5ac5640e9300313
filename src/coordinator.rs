//! Round-submission coordinator
//!
//! The merge point of the agent. Round announcements from the poller and
//! drumbeat ticks arrive on channels and are processed strictly one at a
//! time, so at most one submission attempt can ever be in flight. Every
//! attempt outcome feeds back into the scheduler, which is the only place
//! allowed to rearm tickers.

use std::sync::Arc;

use num_bigint::BigInt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::chain::abi::Address;
use crate::chain::aggregator::ChainApi;
use crate::deviation;
use crate::models::{ChainEvent, Round};
use crate::pricefeed::PriceSource;
use crate::schedule::Scheduler;
use crate::submitter::{AttemptOutcome, Submitter};

/// Round hint meaning "let the contract pick the applicable round".
const ROUND_HINT_CURRENT: u64 = 0;

pub struct Coordinator {
    chain: Arc<dyn ChainApi>,
    price: Arc<dyn PriceSource>,
    submitter: Submitter,
    scheduler: Scheduler,
    own_address: Address,
    /// Feed decimals read from the contract at bootstrap; scales the float
    /// price into on-chain units.
    decimals: u8,
    /// Whether a round announcement alone, without a price deviation, is
    /// answered.
    answer_round_starts: bool,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainApi>,
        price: Arc<dyn PriceSource>,
        submitter: Submitter,
        scheduler: Scheduler,
        own_address: Address,
        decimals: u8,
        answer_round_starts: bool,
    ) -> Self {
        Self {
            chain,
            price,
            submitter,
            scheduler,
            own_address,
            decimals,
            answer_round_starts,
        }
    }

    /// Single-consumer loop. Runs until shutdown flips or every producer is
    /// gone.
    pub async fn run(
        mut self,
        mut chain_events: mpsc::Receiver<ChainEvent>,
        mut drumbeat: mpsc::Receiver<()>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(
            decimals = self.decimals,
            answer_round_starts = self.answer_round_starts,
            "coordinator started"
        );
        let mut chain_open = true;
        let mut beat_open = true;
        while chain_open || beat_open {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = chain_events.recv(), if chain_open => {
                    match event {
                        Some(ChainEvent::RoundStarted(round)) => self.handle_round(round).await,
                        Some(ChainEvent::AnswerUpdated { round_id, answer, updated_at }) => {
                            debug!(round_id, answer = %answer, updated_at, "answer updated on chain");
                        }
                        None => chain_open = false,
                    }
                }
                beat = drumbeat.recv(), if beat_open => {
                    match beat {
                        Some(()) => self.handle_drumbeat().await,
                        None => beat_open = false,
                    }
                }
            }
        }
        info!("coordinator stopped");
    }

    /// A round someone else started. Submit at round 0 when the fresh price
    /// deviates from the recorded answer; otherwise answer the announced
    /// round itself, if configured to.
    async fn handle_round(&mut self, round: Round) {
        if round.started_by == self.own_address {
            debug!(round_id = round.id, "ignoring round started by this agent");
            return;
        }

        let current = match self.chain.latest_round_data().await {
            Ok(data) => data.answer,
            Err(e) => {
                warn!(round_id = round.id, error = %e, "failed to read latest answer");
                return;
            }
        };

        let Some(fresh) = self.fresh_scaled_price().await else {
            return;
        };

        if deviation::exceeds_threshold(&current, &fresh) {
            info!(
                round_id = round.id,
                current = %current,
                fresh = %fresh,
                "price deviated past threshold"
            );
            self.attempt(ROUND_HINT_CURRENT, fresh).await;
        } else if self.answer_round_starts {
            debug!(round_id = round.id, "no deviation, answering the announced round");
            self.attempt(round.id, fresh).await;
        } else {
            debug!(round_id = round.id, "no deviation, round left to other oracles");
        }
    }

    /// Periodic heartbeat: refresh the feed regardless of deviation.
    async fn handle_drumbeat(&mut self) {
        let Some(fresh) = self.fresh_scaled_price().await else {
            return;
        };
        self.attempt(ROUND_HINT_CURRENT, fresh).await;
    }

    async fn fresh_scaled_price(&self) -> Option<BigInt> {
        let sample = match self.price.fetch().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "price fetch failed, cycle abandoned");
                return None;
            }
        };

        match deviation::scale_price(sample.value, self.decimals) {
            Some(scaled) => Some(scaled),
            None => {
                warn!(value = sample.value, "price did not scale to an integer");
                None
            }
        }
    }

    /// Delegate to the submitter with the drumbeat parked, then let the
    /// scheduler translate the outcome into timer state.
    async fn attempt(&mut self, round_hint: u64, answer: BigInt) {
        self.scheduler.hold_submissions();

        let outcome = self.submitter.run_attempt(round_hint, answer).await;
        match &outcome {
            AttemptOutcome::Submitted { round_id, tx_hash, .. } => {
                info!(round_id, tx_hash = %tx_hash, "round answered");
                self.scheduler.rearm_after_confirmed();
            }
            AttemptOutcome::NotEligible { elapsed } => {
                let delay = self.scheduler.rearm_not_eligible(*elapsed);
                info!(retry_in = ?delay, "submission deferred");
            }
            AttemptOutcome::Aborted { reason } => {
                warn!(reason = %reason, "attempt abandoned before send");
                self.scheduler.rearm_after_failure();
            }
            AttemptOutcome::SendFailed { round_id, reason } => {
                error!(round_id, reason = %reason, "submission failed");
                self.scheduler.rearm_after_failure();
            }
            AttemptOutcome::Reverted { round_id, tx_hash } => {
                error!(round_id, tx_hash = %tx_hash, "submission reverted");
                self.scheduler.rearm_after_failure();
            }
        }
    }
}
