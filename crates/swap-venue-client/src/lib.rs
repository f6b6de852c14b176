//! Swap aggregator client: route quotes, unsigned swap transactions and
//! execution status by signature.

mod client;
mod error;
mod types;

pub use client::SwapVenueClient;
pub use error::SwapVenueError;
pub use types::*;
