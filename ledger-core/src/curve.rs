// Sum-of-squares bonding curve.
//
// P(n) = n * (n + 1) * (2n + 1) / 6 is the cumulative price of the first `n`
// tokens. Every trade is priced as the distance between two points on the
// curve, so mint previews, burn previews and historical reconstruction all go
// through `BondingCurve::cost_between`.

use crate::models::EventKind;
use serde::Deserialize;
use uint::construct_uint;

construct_uint! {
    /// 256-bit unsigned integer for chain values (amounts, supplies).
    pub struct U256(4);
}

construct_uint! {
    /// Wide integer used for curve evaluation. `P(n)` for any `n < 2^257`
    /// stays below 2^773, so no curve evaluation can overflow.
    pub struct U1024(16);
}

/// Cumulative or incremental curve price.
pub type Price = U1024;

/// Widen a chain integer into curve space.
pub fn widen(value: U256) -> U1024 {
    let mut limbs = [0u64; 16];
    limbs[..4].copy_from_slice(&value.0);
    U1024(limbs)
}

/// Closed form of `1^2 + 2^2 + ... + n^2`.
pub fn sum_of_squares(n: U1024) -> U1024 {
    if n.is_zero() {
        return U1024::zero();
    }
    let one = U1024::one();
    let two = U1024::from(2u64);
    // n(n+1) is always even and one of the three factors is divisible by 3,
    // so the product is an exact multiple of 6.
    n * (n + one) * (two * n + one) / U1024::from(6u64)
}

/// Curve parameters for one token contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct BondingCurve {
    /// Scales every curve price. Contracts that price directly off the
    /// sum of squares use 1.
    #[serde(default = "default_multiplier")]
    pub multiplier: u64,
}

fn default_multiplier() -> u64 {
    1
}

impl Default for BondingCurve {
    fn default() -> Self {
        Self { multiplier: 1 }
    }
}

impl BondingCurve {
    pub fn new(multiplier: u64) -> Self {
        Self { multiplier }
    }

    /// Cumulative price `P(supply)`.
    pub fn price_at(&self, supply: U1024) -> Price {
        sum_of_squares(supply) * U1024::from(self.multiplier)
    }

    /// Cost of moving the supply between `a` and `b`, in either direction.
    pub fn cost_between(&self, a: U1024, b: U1024) -> Price {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        self.price_at(hi) - self.price_at(lo)
    }

    /// Cost of minting `amount` on top of `supply`.
    pub fn mint_cost(&self, supply: U256, amount: U256) -> Price {
        let from = widen(supply);
        self.cost_between(from, from + widen(amount))
    }

    /// Proceeds of burning `amount` out of `supply`. The post-burn supply is
    /// floored at zero.
    pub fn burn_proceeds(&self, supply: U256, amount: U256) -> Price {
        let from = widen(supply);
        let to = from.saturating_sub(widen(amount));
        self.cost_between(to, from)
    }

    /// Value of a historical event given the supply observed right after it.
    ///
    /// Mint: `P(after) - P(max(after - amount, 0))`.
    /// Burn: `P(after + amount) - P(after)`.
    pub fn trade_value(&self, kind: EventKind, total_supply_after: U256, amount: U256) -> Price {
        let after = widen(total_supply_after);
        let amount = widen(amount);
        match kind {
            EventKind::Mint => self.cost_between(after.saturating_sub(amount), after),
            EventKind::Burn => self.cost_between(after, after + amount),
        }
    }
}

/// Percentage delta of `price` against the preceding trade's price.
/// Zero when there is no predecessor or the predecessor was free.
pub fn price_change_percent(previous: Option<&Price>, price: &Price) -> f64 {
    let Some(prev) = previous else {
        return 0.0;
    };
    if prev.is_zero() {
        return 0.0;
    }

    // Keep six decimals of the percentage in integer space before the lossy
    // conversion.
    let scale = U1024::from(100_000_000u64);
    let (diff, negative) = if price >= prev {
        (*price - *prev, false)
    } else {
        (*prev - *price, true)
    };
    let scaled = to_f64(&(diff * scale / *prev)) / 1_000_000.0;
    if negative {
        -scaled
    } else {
        scaled
    }
}

fn to_f64(value: &U1024) -> f64 {
    value
        .0
        .iter()
        .rev()
        .fold(0.0, |acc, limb| acc * 18_446_744_073_709_551_616.0 + *limb as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(n: u64) -> U1024 {
        sum_of_squares(U1024::from(n))
    }

    #[test]
    fn test_sum_of_squares_small_values() {
        assert_eq!(p(0), U1024::zero());
        assert_eq!(p(1), U1024::from(1u64));
        assert_eq!(p(2), U1024::from(5u64));
        assert_eq!(p(3), U1024::from(14u64));
        assert_eq!(p(5), U1024::from(55u64));
    }

    #[test]
    fn test_incremental_cost_matches_explicit_sum() {
        let curve = BondingCurve::default();
        for a in 0u64..20 {
            for b in a..20 {
                let explicit: u64 = (a + 1..=b).map(|k| k * k).sum();
                assert_eq!(
                    curve.cost_between(U1024::from(a), U1024::from(b)),
                    U1024::from(explicit),
                    "a={a} b={b}"
                );
                // direction does not matter
                assert_eq!(
                    curve.cost_between(U1024::from(b), U1024::from(a)),
                    U1024::from(explicit)
                );
            }
        }
    }

    #[test]
    fn test_mint_and_burn_previews() {
        let curve = BondingCurve::default();
        // 3 -> 5: 16 + 25
        assert_eq!(
            curve.mint_cost(U256::from(3u64), U256::from(2u64)),
            U1024::from(41u64)
        );
        // 5 -> 3
        assert_eq!(
            curve.burn_proceeds(U256::from(5u64), U256::from(2u64)),
            U1024::from(41u64)
        );
    }

    #[test]
    fn test_burn_floors_supply_at_zero() {
        let curve = BondingCurve::default();
        // burning more than exists only refunds down to zero supply
        assert_eq!(
            curve.burn_proceeds(U256::from(2u64), U256::from(10u64)),
            U1024::from(5u64)
        );
    }

    #[test]
    fn test_trade_value_from_post_event_supply() {
        let curve = BondingCurve::default();
        assert_eq!(
            curve.trade_value(EventKind::Mint, U256::from(5u64), U256::from(5u64)),
            U1024::from(55u64)
        );
        assert_eq!(
            curve.trade_value(EventKind::Burn, U256::from(3u64), U256::from(2u64)),
            U1024::from(41u64)
        );
        // inconsistent mint amount larger than supply clamps at zero
        assert_eq!(
            curve.trade_value(EventKind::Mint, U256::from(2u64), U256::from(7u64)),
            U1024::from(5u64)
        );
    }

    #[test]
    fn test_multiplier_scales_prices() {
        let curve = BondingCurve::new(1_000);
        assert_eq!(
            curve.mint_cost(U256::zero(), U256::from(2u64)),
            U1024::from(5_000u64)
        );
    }

    #[test]
    fn test_max_chain_values_do_not_overflow() {
        let curve = BondingCurve::new(u64::MAX);
        let value = curve.trade_value(EventKind::Burn, U256::MAX, U256::MAX);
        assert!(!value.is_zero());
        let mint = curve.mint_cost(U256::MAX, U256::MAX);
        assert_eq!(mint, value);
    }

    #[test]
    fn test_price_change_percent() {
        let prev = U1024::from(100u64);
        assert_eq!(price_change_percent(None, &prev), 0.0);
        assert_eq!(price_change_percent(Some(&U1024::zero()), &prev), 0.0);

        let up = price_change_percent(Some(&prev), &U1024::from(150u64));
        assert!((up - 50.0).abs() < 1e-9);

        let down = price_change_percent(Some(&prev), &U1024::from(25u64));
        assert!((down + 75.0).abs() < 1e-9);

        let third = price_change_percent(Some(&U1024::from(3u64)), &U1024::from(4u64));
        assert!((third - 33.333333).abs() < 1e-6);
    }
}
