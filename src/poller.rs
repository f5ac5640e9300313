//! Chain event poller
//!
//! On each tick, scans `[cursor, head]` for `NewRound` and `AnswerUpdated`
//! logs at the feed address and forwards fresh round announcements to the
//! coordinator. The cursor only advances after a successful scan, so a failed
//! cycle is retried over the same window extended by whatever blocks arrived
//! in the meantime.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::chain::abi::Address;
use crate::chain::aggregator::{decode_event, AggregatorEvent, ChainApi};
use crate::chain::rpc::RpcError;
use crate::headtracker::SharedHead;
use crate::models::ChainEvent;

pub struct ChainEventPoller {
    chain: Arc<dyn ChainApi>,
    shared_head: SharedHead,
    own_address: Address,
    /// Next scan starts here; `None` until the first cycle picks a start.
    cursor: Option<u64>,
    start_block: Option<u64>,
    /// Highest round id already forwarded, for de-duplication across the
    /// one-block window overlap between cycles.
    last_forwarded_round: u64,
}

impl ChainEventPoller {
    pub fn new(
        chain: Arc<dyn ChainApi>,
        shared_head: SharedHead,
        own_address: Address,
        start_block: Option<u64>,
    ) -> Self {
        Self {
            chain,
            shared_head,
            own_address,
            cursor: None,
            start_block,
            last_forwarded_round: 0,
        }
    }

    pub fn cursor(&self) -> Option<u64> {
        self.cursor
    }

    /// Head block for this cycle: the tracker's shared head when one has been
    /// observed, otherwise a direct query.
    async fn head(&self) -> Result<u64, RpcError> {
        if let Some(head) = *self.shared_head.lock() {
            return Ok(head);
        }
        self.chain.block_number().await
    }

    /// One scan cycle. Errors leave the cursor untouched.
    pub async fn poll_once(&mut self) -> Result<Vec<ChainEvent>, RpcError> {
        let head = self.head().await?;
        let from = match self.cursor {
            Some(cursor) => cursor,
            None => self.start_block.unwrap_or(head),
        };

        if head < from {
            debug!(head, from, "head behind cursor, skipping cycle");
            return Ok(Vec::new());
        }

        let logs = self.chain.feed_logs(from, head).await?;
        let latest_round = self.chain.latest_round().await?;
        debug!(
            from,
            to = head,
            logs = logs.len(),
            latest_round,
            "scanned feed logs"
        );

        let mut events = Vec::new();
        for log in &logs {
            match decode_event(log) {
                Some(AggregatorEvent::NewRound(round)) => {
                    if round.started_by == self.own_address {
                        debug!(round_id = round.id, "skipping self-started round");
                        continue;
                    }
                    // Stale announcements (already answered or already seen)
                    // do not get forwarded.
                    if round.id < latest_round || round.id <= self.last_forwarded_round {
                        continue;
                    }
                    self.last_forwarded_round = round.id;
                    info!(
                        round_id = round.id,
                        started_by = %round.started_by,
                        "new round announced"
                    );
                    events.push(ChainEvent::RoundStarted(round));
                }
                Some(AggregatorEvent::AnswerUpdated {
                    answer,
                    round_id,
                    updated_at,
                }) => {
                    events.push(ChainEvent::AnswerUpdated {
                        round_id,
                        answer,
                        updated_at,
                    });
                }
                // Not one of ours, skip silently
                None => {}
            }
        }

        self.cursor = Some(head);
        Ok(events)
    }

    /// Tick-driven loop; exits when the tick source closes, the coordinator
    /// goes away or shutdown flips.
    pub async fn run(
        mut self,
        mut ticks: mpsc::Receiver<()>,
        events_tx: mpsc::Sender<ChainEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("chain event poller started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                tick = ticks.recv() => {
                    if tick.is_none() {
                        break;
                    }
                    match self.poll_once().await {
                        Ok(events) => {
                            for event in events {
                                if events_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "poll cycle failed, will retry"),
                    }
                }
            }
        }
        info!("chain event poller stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::abi;
    use crate::chain::aggregator::{
        OracleRoundState, RoundData, TOPIC_ANSWER_UPDATED, TOPIC_NEW_ROUND,
    };
    use crate::chain::rpc::{LogEntry, TransactionReceipt};
    use async_trait::async_trait;
    use num_bigint::{BigInt, BigUint};
    use parking_lot::Mutex;

    fn addr(byte: u8) -> Address {
        Address([byte; 20])
    }

    fn new_round_log(round_id: u64, started_by: &Address) -> LogEntry {
        LogEntry {
            address: "0xfeed".into(),
            topics: vec![
                TOPIC_NEW_ROUND.to_string(),
                format!("0x{}", hex::encode(abi::encode_u64(round_id))),
                format!("0x{}", hex::encode(abi::encode_address(started_by))),
            ],
            data: format!("0x{}", hex::encode(abi::encode_u64(1_700_000_000))),
            block_number: None,
            transaction_hash: None,
            removed: None,
        }
    }

    fn answer_log(round_id: u64, answer: i64) -> LogEntry {
        LogEntry {
            address: "0xfeed".into(),
            topics: vec![
                TOPIC_ANSWER_UPDATED.to_string(),
                format!(
                    "0x{}",
                    hex::encode(abi::encode_int(&BigInt::from(answer)).unwrap())
                ),
                format!("0x{}", hex::encode(abi::encode_u64(round_id))),
            ],
            data: format!("0x{}", hex::encode(abi::encode_u64(1_700_000_100))),
            block_number: None,
            transaction_hash: None,
            removed: None,
        }
    }

    /// Scripted chain: a queue of per-cycle results.
    struct FakeChain {
        heads: Mutex<Vec<u64>>,
        logs: Mutex<Vec<Result<Vec<LogEntry>, ()>>>,
        latest_round: u64,
        windows: Mutex<Vec<(u64, u64)>>,
    }

    impl FakeChain {
        fn new(heads: Vec<u64>, logs: Vec<Result<Vec<LogEntry>, ()>>, latest_round: u64) -> Self {
            Self {
                heads: Mutex::new(heads),
                logs: Mutex::new(logs),
                latest_round,
                windows: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChainApi for FakeChain {
        async fn block_number(&self) -> Result<u64, RpcError> {
            Ok(self.heads.lock().remove(0))
        }

        async fn balance(&self, _address: &Address) -> Result<BigUint, RpcError> {
            Ok(BigUint::default())
        }

        async fn feed_logs(&self, from: u64, to: u64) -> Result<Vec<LogEntry>, RpcError> {
            self.windows.lock().push((from, to));
            self.logs.lock().remove(0).map_err(|_| RpcError::Decode("scripted failure".into()))
        }

        async fn decimals(&self) -> Result<u8, RpcError> {
            Ok(2)
        }

        async fn latest_round(&self) -> Result<u64, RpcError> {
            Ok(self.latest_round)
        }

        async fn latest_round_data(&self) -> Result<RoundData, RpcError> {
            unimplemented!("not used by the poller")
        }

        async fn oracle_round_state(
            &self,
            _oracle: &Address,
            _queried_round_id: u32,
        ) -> Result<OracleRoundState, RpcError> {
            unimplemented!("not used by the poller")
        }

        async fn submit(&self, _round_id: u64, _answer: &BigInt) -> Result<String, RpcError> {
            unimplemented!("not used by the poller")
        }

        async fn transaction_receipt(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<TransactionReceipt>, RpcError> {
            unimplemented!("not used by the poller")
        }
    }

    fn poller(chain: Arc<FakeChain>, own: Address, start: Option<u64>) -> ChainEventPoller {
        ChainEventPoller::new(chain, Arc::new(Mutex::new(None)), own, start)
    }

    #[tokio::test]
    async fn test_cursor_advances_even_with_zero_logs() {
        let chain = Arc::new(FakeChain::new(
            vec![100, 110],
            vec![Ok(vec![]), Ok(vec![])],
            5,
        ));
        let mut poller = poller(chain, addr(0xaa), Some(90));

        assert!(poller.poll_once().await.unwrap().is_empty());
        assert_eq!(poller.cursor(), Some(100));

        assert!(poller.poll_once().await.unwrap().is_empty());
        assert_eq!(poller.cursor(), Some(110));
    }

    #[tokio::test]
    async fn test_cursor_unchanged_on_error() {
        let chain = Arc::new(FakeChain::new(vec![100, 110], vec![Err(()), Ok(vec![])], 5));
        let mut poller = poller(chain.clone(), addr(0xaa), Some(90));

        assert!(poller.poll_once().await.is_err());
        assert_eq!(poller.cursor(), None);

        // Next cycle rescans from the original start over the taller window
        poller.poll_once().await.unwrap();
        assert_eq!(poller.cursor(), Some(110));
        assert_eq!(chain.windows.lock().clone(), vec![(90, 100), (90, 110)]);
    }

    #[tokio::test]
    async fn test_self_and_stale_rounds_filtered() {
        let own = addr(0xaa);
        let other = addr(0xbb);
        let logs = vec![Ok(vec![
            new_round_log(6, &own),   // self-started, dropped
            new_round_log(4, &other), // below the contract's latest round
            new_round_log(6, &other), // forwarded
            new_round_log(6, &other), // duplicate, dropped
        ])];
        let chain = Arc::new(FakeChain::new(vec![100], logs, 5));
        let mut poller = poller(chain, own, Some(90));

        let events = poller.poll_once().await.unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            ChainEvent::RoundStarted(round) => {
                assert_eq!(round.id, 6);
                assert_eq!(round.started_by, other);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_answer_updates_forwarded() {
        let chain = Arc::new(FakeChain::new(
            vec![100],
            vec![Ok(vec![answer_log(5, 10_200)])],
            5,
        ));
        let mut poller = poller(chain, addr(0xaa), Some(90));

        let events = poller.poll_once().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            ChainEvent::AnswerUpdated { round_id: 5, .. }
        ));
    }

    #[tokio::test]
    async fn test_first_cycle_starts_at_head_without_replay() {
        let chain = Arc::new(FakeChain::new(vec![100], vec![Ok(vec![])], 5));
        let mut poller = poller(chain.clone(), addr(0xaa), None);

        poller.poll_once().await.unwrap();
        assert_eq!(chain.windows.lock().clone(), vec![(100, 100)]);
    }
}
