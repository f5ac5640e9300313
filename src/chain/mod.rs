//! Chain collaborators: JSON-RPC transport, word codec, the typed aggregator
//! surface and the agent's account identity.

pub mod abi;
pub mod aggregator;
pub mod rpc;
pub mod wallet;
