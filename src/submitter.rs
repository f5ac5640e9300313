//! Submission state machine
//!
//! One attempt runs Gating, Submitting, Confirming in order and reports a
//! single outcome. The round id the caller passes is only a hint for the
//! eligibility query; whatever round the contract reports back is the round
//! that gets submitted. Timer decisions live with the coordinator, never here.

use std::sync::Arc;
use std::time::Duration;

use num_bigint::{BigInt, BigUint};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::chain::abi::Address;
use crate::chain::aggregator::ChainApi;

/// How often to look for the receipt while confirming.
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Terminal result of one submission attempt.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// Transaction mined with success status.
    Submitted {
        round_id: u64,
        answer: BigInt,
        tx_hash: String,
    },
    /// The contract is not accepting a submission from this oracle right now.
    /// A normal outcome, not an error.
    NotEligible { elapsed: Duration },
    /// Infrastructure failed before anything was sent; the cycle is abandoned
    /// and the next tick retries.
    Aborted { reason: String },
    /// The send itself failed, or the transaction never confirmed in time.
    SendFailed { round_id: u64, reason: String },
    /// Mined with revert status.
    Reverted { round_id: u64, tx_hash: String },
}

pub struct Submitter {
    chain: Arc<dyn ChainApi>,
    oracle: Address,
    receipt_timeout: Duration,
    dry_run: bool,
    shutdown: watch::Receiver<bool>,
}

impl Submitter {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        oracle: Address,
        receipt_timeout: Duration,
        dry_run: bool,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chain,
            oracle,
            receipt_timeout,
            dry_run,
            shutdown,
        }
    }

    /// Run one full attempt. The caller must not start another until this
    /// resolves.
    pub async fn run_attempt(&self, round_hint: u64, answer: BigInt) -> AttemptOutcome {
        let started = Instant::now();

        // Gating: read eligibility fresh, right before committing. A state
        // fetched any earlier could have been invalidated by another oracle.
        let hint = match u32::try_from(round_hint) {
            Ok(hint) => hint,
            Err(_) => {
                return AttemptOutcome::Aborted {
                    reason: format!("round hint {round_hint} exceeds u32"),
                }
            }
        };
        let state = match self.chain.oracle_round_state(&self.oracle, hint).await {
            Ok(state) => state,
            Err(e) => {
                return AttemptOutcome::Aborted {
                    reason: format!("oracleRoundState failed: {e}"),
                }
            }
        };

        if !state.eligible_to_submit {
            info!(
                queried_round = round_hint,
                reported_round = state.round_id,
                "not eligible to submit"
            );
            return AttemptOutcome::NotEligible {
                elapsed: started.elapsed(),
            };
        }

        if !sufficient_funds(&state.available_funds, &state.payment_amount, state.oracle_count) {
            warn!(
                round_id = state.round_id,
                available = %state.available_funds,
                payment = %state.payment_amount,
                oracles = state.oracle_count,
                "aggregator cannot pay a full round, holding back"
            );
            return AttemptOutcome::NotEligible {
                elapsed: started.elapsed(),
            };
        }

        // The gate's round id is authoritative from here on.
        let round_id = state.round_id as u64;

        if self.dry_run {
            info!(round_id, answer = %answer, "dry run, submission not sent");
            return AttemptOutcome::Submitted {
                round_id,
                answer,
                tx_hash: "0x0".to_string(),
            };
        }

        // Submitting
        let tx_hash = match self.chain.submit(round_id, &answer).await {
            Ok(hash) => hash,
            Err(e) => {
                return AttemptOutcome::SendFailed {
                    round_id,
                    reason: format!("send failed: {e}"),
                }
            }
        };
        info!(round_id, answer = %answer, tx_hash = %tx_hash, "submission sent");

        // Confirming
        self.confirm(round_id, answer, tx_hash).await
    }

    /// Poll for the receipt until mined, timed out or shut down.
    async fn confirm(&self, round_id: u64, answer: BigInt, tx_hash: String) -> AttemptOutcome {
        let deadline = Instant::now() + self.receipt_timeout;
        let mut shutdown = self.shutdown.clone();

        loop {
            match self.chain.transaction_receipt(&tx_hash).await {
                Ok(Some(receipt)) => {
                    return if receipt.succeeded() {
                        info!(round_id, tx_hash = %tx_hash, "submission confirmed");
                        AttemptOutcome::Submitted {
                            round_id,
                            answer,
                            tx_hash,
                        }
                    } else {
                        AttemptOutcome::Reverted { round_id, tx_hash }
                    };
                }
                Ok(None) => {}
                // Transient lookup failures just mean we ask again
                Err(e) => warn!(tx_hash = %tx_hash, error = %e, "receipt lookup failed"),
            }

            if Instant::now() >= deadline {
                return AttemptOutcome::SendFailed {
                    round_id,
                    reason: format!("no receipt within {:?}", self.receipt_timeout),
                };
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_ok() && *shutdown.borrow() {
                        return AttemptOutcome::SendFailed {
                            round_id,
                            reason: "shut down before confirmation".to_string(),
                        };
                    }
                    // A dropped sender means no signal can ever arrive; fall
                    // back to plain pacing
                    if changed.is_err() {
                        tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
                    }
                }
                _ = tokio::time::sleep(RECEIPT_POLL_INTERVAL) => {}
            }
        }
    }
}

/// The aggregator must be able to pay every oracle for the round.
pub fn sufficient_funds(available: &BigUint, payment: &BigUint, oracle_count: u8) -> bool {
    *available >= payment * oracle_count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi::Address;
    use crate::chain::aggregator::{OracleRoundState, RoundData};
    use crate::chain::rpc::{LogEntry, RpcError, TransactionReceipt};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    fn round_state(eligible: bool) -> OracleRoundState {
        OracleRoundState {
            eligible_to_submit: eligible,
            round_id: 8,
            latest_submission: BigInt::from(10_000),
            started_at: 0,
            timeout_seconds: 600,
            available_funds: BigUint::from(1_000u32),
            oracle_count: 4,
            payment_amount: BigUint::from(10u32),
        }
    }

    #[derive(Default)]
    struct FakeChain {
        state: Mutex<Option<OracleRoundState>>,
        submitted: Mutex<Vec<(u64, BigInt)>>,
        receipt_status: Mutex<Option<&'static str>>,
        send_fails: bool,
    }

    #[async_trait]
    impl ChainApi for FakeChain {
        async fn block_number(&self) -> Result<u64, RpcError> {
            Ok(0)
        }

        async fn balance(&self, _address: &Address) -> Result<BigUint, RpcError> {
            Ok(BigUint::default())
        }

        async fn feed_logs(&self, _from: u64, _to: u64) -> Result<Vec<LogEntry>, RpcError> {
            Ok(vec![])
        }

        async fn decimals(&self) -> Result<u8, RpcError> {
            Ok(2)
        }

        async fn latest_round(&self) -> Result<u64, RpcError> {
            Ok(8)
        }

        async fn latest_round_data(&self) -> Result<RoundData, RpcError> {
            unimplemented!("not used by the submitter")
        }

        async fn oracle_round_state(
            &self,
            _oracle: &Address,
            _queried_round_id: u32,
        ) -> Result<OracleRoundState, RpcError> {
            self.state
                .lock()
                .clone()
                .ok_or_else(|| RpcError::Decode("scripted gate failure".into()))
        }

        async fn submit(&self, round_id: u64, answer: &BigInt) -> Result<String, RpcError> {
            if self.send_fails {
                return Err(RpcError::Node {
                    code: -32000,
                    message: "nonce too low".into(),
                });
            }
            self.submitted.lock().push((round_id, answer.clone()));
            Ok("0xabc".to_string())
        }

        async fn transaction_receipt(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<TransactionReceipt>, RpcError> {
            Ok(self.receipt_status.lock().map(|status| TransactionReceipt {
                status: Some(status.to_string()),
                block_number: Some("0x10".into()),
            }))
        }
    }

    fn submitter(chain: Arc<FakeChain>, dry_run: bool) -> Submitter {
        let (_tx, rx) = watch::channel(false);
        Submitter::new(
            chain,
            Address([0xaa; 20]),
            Duration::from_secs(5),
            dry_run,
            rx,
        )
    }

    #[tokio::test]
    async fn test_ineligible_never_reaches_send() {
        let chain = Arc::new(FakeChain {
            state: Mutex::new(Some(round_state(false))),
            ..Default::default()
        });
        let outcome = submitter(chain.clone(), false)
            .run_attempt(0, BigInt::from(10_200))
            .await;

        assert!(matches!(outcome, AttemptOutcome::NotEligible { .. }));
        assert!(chain.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_underfunded_round_is_held_back() {
        let mut state = round_state(true);
        state.available_funds = BigUint::from(39u32); // needs 4 * 10
        let chain = Arc::new(FakeChain {
            state: Mutex::new(Some(state)),
            ..Default::default()
        });
        let outcome = submitter(chain.clone(), false)
            .run_attempt(0, BigInt::from(10_200))
            .await;

        assert!(matches!(outcome, AttemptOutcome::NotEligible { .. }));
        assert!(chain.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_gate_round_id_overrides_hint() {
        let chain = Arc::new(FakeChain {
            state: Mutex::new(Some(round_state(true))),
            receipt_status: Mutex::new(Some("0x1")),
            ..Default::default()
        });
        let outcome = submitter(chain.clone(), false)
            .run_attempt(0, BigInt::from(10_200))
            .await;

        match outcome {
            AttemptOutcome::Submitted { round_id, .. } => assert_eq!(round_id, 8),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(chain.submitted.lock().clone(), vec![(8, BigInt::from(10_200))]);
    }

    #[tokio::test]
    async fn test_send_failure_surfaces() {
        let chain = Arc::new(FakeChain {
            state: Mutex::new(Some(round_state(true))),
            send_fails: true,
            ..Default::default()
        });
        let outcome = submitter(chain, false).run_attempt(0, BigInt::from(1)).await;
        assert!(matches!(outcome, AttemptOutcome::SendFailed { .. }));
    }

    #[tokio::test]
    async fn test_reverted_receipt_reported() {
        let chain = Arc::new(FakeChain {
            state: Mutex::new(Some(round_state(true))),
            receipt_status: Mutex::new(Some("0x0")),
            ..Default::default()
        });
        let outcome = submitter(chain, false).run_attempt(0, BigInt::from(1)).await;
        assert!(matches!(outcome, AttemptOutcome::Reverted { .. }));
    }

    #[tokio::test]
    async fn test_gate_failure_aborts_cycle() {
        let chain = Arc::new(FakeChain::default());
        let outcome = submitter(chain.clone(), false)
            .run_attempt(0, BigInt::from(1))
            .await;
        assert!(matches!(outcome, AttemptOutcome::Aborted { .. }));
        assert!(chain.submitted.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_skips_send() {
        let chain = Arc::new(FakeChain {
            state: Mutex::new(Some(round_state(true))),
            ..Default::default()
        });
        let outcome = submitter(chain.clone(), true)
            .run_attempt(0, BigInt::from(10_200))
            .await;

        assert!(matches!(outcome, AttemptOutcome::Submitted { .. }));
        assert!(chain.submitted.lock().is_empty());
    }

    #[test]
    fn test_sufficient_funds_boundary() {
        let payment = BigUint::from(10u32);
        assert!(sufficient_funds(&BigUint::from(40u32), &payment, 4));
        assert!(!sufficient_funds(&BigUint::from(39u32), &payment, 4));
        // A feed with no oracles needs nothing
        assert!(sufficient_funds(&BigUint::default(), &payment, 0));
    }
}
