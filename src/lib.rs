pub mod chain;
pub mod client;
pub mod config;
pub mod consensus;
pub mod countdown;
pub mod crypto;
pub mod network;
pub mod pool;
pub mod rpc;
pub mod sync_info;
pub mod timeout;
pub mod types;
pub mod verifier;
