//! Typed surface over the price aggregator contract
//!
//! The agent talks to one FluxAggregator-style contract. Reads go through
//! `eth_call` with hand-encoded words, writes through a node-signed
//! `submit(roundId, answer)`. Event decoding tolerates foreign logs by
//! returning `None` instead of an error.

use std::sync::Arc;

use async_trait::async_trait;
use num_bigint::{BigInt, BigUint};
use tracing::debug;

use super::abi::{self, Address};
use super::rpc::{LogEntry, RpcClient, RpcError, TransactionReceipt};
use crate::models::Round;

// Selectors for the aggregator methods this agent uses.
const SEL_DECIMALS: &str = "0x313ce567";
const SEL_LATEST_ROUND: &str = "0x668a0f02";
const SEL_LATEST_ROUND_DATA: &str = "0xfeaf968c";
const SEL_ORACLE_ROUND_STATE: &str = "0x88aa80e7";
const SEL_SUBMIT: &str = "0x202ee0ed";

/// topic0 of `NewRound(uint256,address,uint256)`
pub const TOPIC_NEW_ROUND: &str =
    "0x0109fc6f55cf40689f02fbaad7af7fe7bbac8a3d2186600afc7d3e10cac60271";
/// topic0 of `AnswerUpdated(int256,uint256,uint256)`
pub const TOPIC_ANSWER_UPDATED: &str =
    "0x0559884fd3a460db3073b7fc896cc77986f16e378210ded43186175bf646fc5f";

/// `latestRoundData()` return tuple.
#[derive(Debug, Clone)]
pub struct RoundData {
    pub round_id: u64,
    pub answer: BigInt,
    pub started_at: u64,
    pub updated_at: u64,
    pub answered_in_round: u64,
}

/// `oracleRoundState(oracle, queriedRoundId)` return tuple.
///
/// Always fetched immediately before a submission attempt and never cached,
/// because eligibility moves with the chain between detection and send.
#[derive(Debug, Clone)]
pub struct OracleRoundState {
    pub eligible_to_submit: bool,
    pub round_id: u32,
    pub latest_submission: BigInt,
    pub started_at: u64,
    pub timeout_seconds: u64,
    pub available_funds: BigUint,
    pub oracle_count: u8,
    pub payment_amount: BigUint,
}

/// Decoded aggregator log.
#[derive(Debug, Clone)]
pub enum AggregatorEvent {
    NewRound(Round),
    AnswerUpdated {
        answer: BigInt,
        round_id: u64,
        updated_at: u64,
    },
}

/// Everything the poller, submitter and coordinator need from the chain.
///
/// The concrete implementation is [`Aggregator`]; tests substitute scripted
/// fakes.
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn block_number(&self) -> Result<u64, RpcError>;
    async fn balance(&self, address: &Address) -> Result<BigUint, RpcError>;
    /// `NewRound` and `AnswerUpdated` logs at the feed address over `[from, to]`.
    async fn feed_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, RpcError>;
    async fn decimals(&self) -> Result<u8, RpcError>;
    async fn latest_round(&self) -> Result<u64, RpcError>;
    async fn latest_round_data(&self) -> Result<RoundData, RpcError>;
    async fn oracle_round_state(
        &self,
        oracle: &Address,
        queried_round_id: u32,
    ) -> Result<OracleRoundState, RpcError>;
    /// Estimate gas, then send `submit(roundId, answer)` from the agent account.
    async fn submit(&self, round_id: u64, answer: &BigInt) -> Result<String, RpcError>;
    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, RpcError>;
}

pub struct Aggregator {
    rpc: Arc<RpcClient>,
    contract: Address,
    from: Address,
}

impl Aggregator {
    pub fn new(rpc: Arc<RpcClient>, contract: Address, from: Address) -> Self {
        Self {
            rpc,
            contract,
            from,
        }
    }

    fn submit_calldata(round_id: u64, answer: &BigInt) -> Result<String, RpcError> {
        let words = [abi::encode_u64(round_id), abi::encode_int(answer)?];
        Ok(abi::calldata(SEL_SUBMIT, &words))
    }
}

#[async_trait]
impl ChainApi for Aggregator {
    async fn block_number(&self) -> Result<u64, RpcError> {
        self.rpc.block_number().await
    }

    async fn balance(&self, address: &Address) -> Result<BigUint, RpcError> {
        self.rpc.balance(address).await
    }

    async fn feed_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<LogEntry>, RpcError> {
        self.rpc
            .get_logs(
                &self.contract,
                &[TOPIC_NEW_ROUND, TOPIC_ANSWER_UPDATED],
                from_block,
                to_block,
            )
            .await
    }

    async fn decimals(&self) -> Result<u8, RpcError> {
        let data = self.rpc.call(&self.contract, SEL_DECIMALS).await?;
        let value = abi::decode_u64(abi::word(&data, 0)?)?;
        u8::try_from(value).map_err(|_| RpcError::Decode("decimals out of range".into()))
    }

    async fn latest_round(&self) -> Result<u64, RpcError> {
        let data = self.rpc.call(&self.contract, SEL_LATEST_ROUND).await?;
        Ok(abi::decode_u64(abi::word(&data, 0)?)?)
    }

    async fn latest_round_data(&self) -> Result<RoundData, RpcError> {
        let data = self.rpc.call(&self.contract, SEL_LATEST_ROUND_DATA).await?;
        Ok(RoundData {
            round_id: abi::decode_u64(abi::word(&data, 0)?)?,
            answer: abi::decode_int(abi::word(&data, 1)?),
            started_at: abi::decode_u64(abi::word(&data, 2)?)?,
            updated_at: abi::decode_u64(abi::word(&data, 3)?)?,
            answered_in_round: abi::decode_u64(abi::word(&data, 4)?)?,
        })
    }

    async fn oracle_round_state(
        &self,
        oracle: &Address,
        queried_round_id: u32,
    ) -> Result<OracleRoundState, RpcError> {
        let words = [
            abi::encode_address(oracle),
            abi::encode_u64(queried_round_id as u64),
        ];
        let calldata = abi::calldata(SEL_ORACLE_ROUND_STATE, &words);
        let data = self.rpc.call(&self.contract, &calldata).await?;
        Ok(OracleRoundState {
            eligible_to_submit: abi::decode_bool(abi::word(&data, 0)?),
            round_id: abi::decode_u64(abi::word(&data, 1)?)? as u32,
            latest_submission: abi::decode_int(abi::word(&data, 2)?),
            started_at: abi::decode_u64(abi::word(&data, 3)?)?,
            timeout_seconds: abi::decode_u64(abi::word(&data, 4)?)?,
            available_funds: abi::decode_uint(abi::word(&data, 5)?),
            oracle_count: abi::decode_u64(abi::word(&data, 6)?)? as u8,
            payment_amount: abi::decode_uint(abi::word(&data, 7)?),
        })
    }

    async fn submit(&self, round_id: u64, answer: &BigInt) -> Result<String, RpcError> {
        let calldata = Self::submit_calldata(round_id, answer)?;
        let gas = self
            .rpc
            .estimate_gas(&self.from, &self.contract, &calldata)
            .await?;
        debug!(round_id, gas, "submitting answer");
        self.rpc
            .send_transaction(&self.from, &self.contract, &calldata, gas)
            .await
    }

    async fn transaction_receipt(
        &self,
        tx_hash: &str,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.rpc.transaction_receipt(tx_hash).await
    }
}

/// Decode one feed log. Logs that are neither `NewRound` nor `AnswerUpdated`,
/// or that carry malformed words, are not ours and yield `None`.
pub fn decode_event(log: &LogEntry) -> Option<AggregatorEvent> {
    let topic0 = log.topics.first()?;

    if topic0.eq_ignore_ascii_case(TOPIC_NEW_ROUND) {
        let round_id = decode_topic_u64(log.topics.get(1)?)?;
        let started_by = abi::decode_address(&decode_topic(log.topics.get(2)?)?);
        let data = abi::decode_hex(&log.data).ok()?;
        let started_at = abi::decode_u64(abi::word(&data, 0).ok()?).ok()?;
        return Some(AggregatorEvent::NewRound(Round {
            id: round_id,
            started_by,
            started_at,
        }));
    }

    if topic0.eq_ignore_ascii_case(TOPIC_ANSWER_UPDATED) {
        let answer = abi::decode_int(&decode_topic(log.topics.get(1)?)?);
        let round_id = decode_topic_u64(log.topics.get(2)?)?;
        let data = abi::decode_hex(&log.data).ok()?;
        let updated_at = abi::decode_u64(abi::word(&data, 0).ok()?).ok()?;
        return Some(AggregatorEvent::AnswerUpdated {
            answer,
            round_id,
            updated_at,
        });
    }

    None
}

fn decode_topic(topic: &str) -> Option<[u8; abi::WORD_LEN]> {
    let bytes = abi::decode_hex(topic).ok()?;
    bytes.try_into().ok()
}

fn decode_topic_u64(topic: &str) -> Option<u64> {
    abi::decode_u64(&decode_topic(topic)?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic_u64(v: u64) -> String {
        format!("0x{}", hex::encode(abi::encode_u64(v)))
    }

    fn topic_address(a: &Address) -> String {
        format!("0x{}", hex::encode(abi::encode_address(a)))
    }

    fn word_hex(w: [u8; abi::WORD_LEN]) -> String {
        format!("0x{}", hex::encode(w))
    }

    #[test]
    fn test_decode_new_round() {
        let starter = Address::from_hex("0x00000000000000000000000000000000000000aa").unwrap();
        let log = LogEntry {
            address: "0xfeed".into(),
            topics: vec![
                TOPIC_NEW_ROUND.to_string(),
                topic_u64(7),
                topic_address(&starter),
            ],
            data: word_hex(abi::encode_u64(1_700_000_000)),
            block_number: None,
            transaction_hash: None,
            removed: None,
        };

        match decode_event(&log) {
            Some(AggregatorEvent::NewRound(round)) => {
                assert_eq!(round.id, 7);
                assert_eq!(round.started_by, starter);
                assert_eq!(round.started_at, 1_700_000_000);
            }
            other => panic!("expected NewRound, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_answer_updated_negative_answer() {
        let answer = BigInt::from(-5i64);
        let log = LogEntry {
            address: "0xfeed".into(),
            topics: vec![
                TOPIC_ANSWER_UPDATED.to_string(),
                word_hex(abi::encode_int(&answer).unwrap()),
                topic_u64(9),
            ],
            data: word_hex(abi::encode_u64(1_700_000_100)),
            block_number: None,
            transaction_hash: None,
            removed: None,
        };

        match decode_event(&log) {
            Some(AggregatorEvent::AnswerUpdated {
                answer: decoded,
                round_id,
                updated_at,
            }) => {
                assert_eq!(decoded, answer);
                assert_eq!(round_id, 9);
                assert_eq!(updated_at, 1_700_000_100);
            }
            other => panic!("expected AnswerUpdated, got {other:?}"),
        }
    }

    #[test]
    fn test_foreign_log_is_skipped() {
        let log = LogEntry {
            address: "0xfeed".into(),
            topics: vec![
                // SubmissionReceived, which the poller does not subscribe to
                "0x92e98423f8adac6e64d0608e519fd1cefb861498385c6dee70d58fc926ddc68c".to_string(),
            ],
            data: "0x".into(),
            block_number: None,
            transaction_hash: None,
            removed: None,
        };
        assert!(decode_event(&log).is_none());
    }

    #[test]
    fn test_truncated_log_is_skipped() {
        let log = LogEntry {
            address: "0xfeed".into(),
            topics: vec![TOPIC_NEW_ROUND.to_string(), topic_u64(1)],
            data: "0x".into(),
            block_number: None,
            transaction_hash: None,
            removed: None,
        };
        assert!(decode_event(&log).is_none());
    }

    #[test]
    fn test_submit_calldata_layout() {
        let data = Aggregator::submit_calldata(3, &BigInt::from(10_200)).unwrap();
        assert!(data.starts_with(SEL_SUBMIT));
        // selector + two 32-byte words
        assert_eq!(data.len(), 10 + 128);
    }
}
