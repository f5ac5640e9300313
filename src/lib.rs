//! Feedkeeper
//!
//! An autonomous price-reporting agent for a FluxAggregator-style feed. It
//! watches the contract for round starts, keeps a drumbeat on an off-chain
//! reference price, and submits node-signed answers whenever either source
//! says a round needs one.

pub mod chain;
pub mod coordinator;
pub mod deviation;
pub mod headtracker;
pub mod models;
pub mod poller;
pub mod pricefeed;
pub mod schedule;
pub mod submitter;
