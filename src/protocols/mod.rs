pub mod uniswap_v4;
