use alloy::primitives::{keccak256, Address, B256, U256, U512};

use crate::utils::constants::{DYNAMIC_FEE_FLAG, TRACKED_POOL_TICK_SPACING};

/// `PoolManager.pools` mapping slot (`StateLibrary.POOLS_SLOT`).
pub const POOLS_SLOT: u64 = 6;

const SQRT_PRICE_BITS: usize = 160;
const Q192_SHIFT: usize = 192;
const PRICE_SCALE_1E12: u64 = 1_000_000_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub currency0: Address,
    pub currency1: Address,
    pub fee_pips: u32,
    pub tick_spacing: i32,
    pub hooks: Address,
}

impl PoolKey {
    /// Key with currencies sorted the way the PoolManager requires (`currency0 < currency1`).
    pub fn sorted(a: Address, b: Address, fee_pips: u32, tick_spacing: i32, hooks: Address) -> Self {
        let (currency0, currency1) = if a <= b { (a, b) } else { (b, a) };
        Self {
            currency0,
            currency1,
            fee_pips,
            tick_spacing,
            hooks,
        }
    }

    /// `abi.encode(currency0, currency1, fee, tickSpacing, hooks)`.
    pub fn abi_encode(&self) -> [u8; 160] {
        let mut out = [0u8; 160];
        out[12..32].copy_from_slice(self.currency0.as_slice());
        out[44..64].copy_from_slice(self.currency1.as_slice());
        out[92..96].copy_from_slice(&self.fee_pips.to_be_bytes());
        if self.tick_spacing < 0 {
            out[96..124].fill(0xff);
        }
        out[124..128].copy_from_slice(&self.tick_spacing.to_be_bytes());
        out[140..160].copy_from_slice(self.hooks.as_slice());
        out
    }
}

/// `PoolId = keccak256(abi.encode(poolKey))`.
pub fn pool_id(key: &PoolKey) -> B256 {
    keccak256(key.abi_encode())
}

/// Storage slot of `pools[poolId].slot0` inside the PoolManager.
pub fn pool_state_slot(pool_id: B256) -> U256 {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(pool_id.as_slice());
    preimage[32..].copy_from_slice(&U256::from(POOLS_SLOT).to_be_bytes::<32>());
    U256::from_be_bytes(keccak256(preimage).0)
}

/// The four tracked pools: ETH/BWORK, ETH/USDC, BWORK/USDC and WETH/BWORK, all dynamic-fee.
pub fn tracked_pool_keys(
    token: Address,
    usdc: Address,
    weth: Address,
    hooks: Address,
) -> [PoolKey; 4] {
    let key = |a, b| PoolKey::sorted(a, b, DYNAMIC_FEE_FLAG, TRACKED_POOL_TICK_SPACING, hooks);
    [
        key(Address::ZERO, token),
        key(Address::ZERO, usdc),
        key(token, usdc),
        key(weth, token),
    ]
}

/// Low 160 bits of a packed slot, i.e. the `sqrtPriceX96` field.
pub fn decode_sqrt_price_slot(word: U256) -> U256 {
    word & ((U256::from(1u8) << SQRT_PRICE_BITS) - U256::from(1u8))
}

fn widen(value: U256) -> U512 {
    U512::from_be_slice(&value.to_be_bytes::<32>())
}

fn narrow(value: U512) -> Option<U256> {
    let bytes = value.to_be_bytes::<64>();
    if bytes[..32].iter().any(|b| *b != 0) {
        return None;
    }
    Some(U256::from_be_slice(&bytes[32..]))
}

/// `(x / 2^96)^2` truncated to an integer: token1 per token0.
pub fn price_q96(sqrt_price_x96: U256) -> U256 {
    let x = widen(decode_sqrt_price_slot(sqrt_price_x96));
    narrow((x * x) >> Q192_SHIFT).unwrap_or(U256::MAX)
}

/// `(x / 2^96)^2 * scale`, truncated.
pub fn price_scaled(sqrt_price_x96: U256, scale: U256) -> U256 {
    let x = widen(decode_sqrt_price_slot(sqrt_price_x96));
    let scaled = x * x * widen(scale);
    narrow(scaled >> Q192_SHIFT).unwrap_or(U256::MAX)
}

/// `(x / 2^96)^2 * 10^12`, keeping six-decimal pairs (USDC against an 18-decimal asset) readable.
pub fn price_scaled_1e12(sqrt_price_x96: U256) -> U256 {
    price_scaled(sqrt_price_x96, U256::from(PRICE_SCALE_1E12))
}
