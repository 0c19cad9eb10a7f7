pub mod client;
pub mod server;
pub mod types;

pub use client::{RpcClient, RpcError};
