//! Agent account identity
//!
//! Key custody lives on the node side; the agent only knows its submitting
//! address. At startup this logs the address and its native balance so an
//! unfunded oracle is visible before the first failed send.

use std::sync::Arc;

use num_bigint::BigUint;
use tracing::{info, warn};

use super::abi::Address;
use super::aggregator::ChainApi;

/// Native token decimals used for display.
const NATIVE_DECIMALS: usize = 18;

pub struct Wallet {
    address: Address,
    chain: Arc<dyn ChainApi>,
}

impl Wallet {
    pub fn new(address: Address, chain: Arc<dyn ChainApi>) -> Self {
        Self { address, chain }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Log the account details; a balance lookup failure is not fatal.
    pub async fn log_details(&self) {
        match self.chain.balance(&self.address).await {
            Ok(balance) => {
                let formatted = format_native(&balance);
                if balance == BigUint::default() {
                    warn!(
                        address = %self.address,
                        "oracle account has zero balance, submissions will fail at the node"
                    );
                } else {
                    info!(address = %self.address, balance = %formatted, "oracle account");
                }
            }
            Err(e) => warn!(address = %self.address, error = %e, "failed to fetch balance"),
        }
    }
}

/// Format a wei-denominated balance with 18 decimal places.
pub fn format_native(wei: &BigUint) -> String {
    let digits = wei.to_str_radix(10);
    if digits.len() <= NATIVE_DECIMALS {
        let mut frac = String::from("0".repeat(NATIVE_DECIMALS - digits.len()));
        frac.push_str(&digits);
        format!("0.{frac}")
    } else {
        let split = digits.len() - NATIVE_DECIMALS;
        format!("{}.{}", &digits[..split], &digits[split..])
    }
}
