//! BWORK aggregator library surface.
//!
//! Historical chart data for the BWORK proof-of-work token and its Uniswap v4 pools,
//! rebuilt from a plain JSON-RPC endpoint: sampled storage slots, the `Mint` event
//! history, batched `aggregate3` reads and the charts derived from them.

pub mod context;
pub mod derive;
pub mod error;
pub mod miners;
pub mod multicall;
pub mod protocols;
pub mod runtime;
pub mod sampler;
pub mod scanner;
pub mod snapshot;
pub mod storage;
pub mod utils;

pub use context::AggregatorContext;
pub use error::{AggregatorError, Result};
