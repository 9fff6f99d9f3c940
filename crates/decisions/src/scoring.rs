//! Pure scoring functions: signal aggregation and risk scores.

use crate::types::{Direction, Signal};

/// Strength totals of a signal set.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Aggregate {
    pub bullish: f64,
    pub bearish: f64,
    pub count: usize,
}

impl Aggregate {
    pub fn of(signals: &[Signal]) -> Self {
        signals.iter().fold(Self::default(), |mut acc, s| {
            let strength = if s.strength.is_finite() {
                s.strength.clamp(0.0, 100.0)
            } else {
                0.0
            };
            match s.direction {
                Direction::Bullish => acc.bullish += strength,
                Direction::Bearish => acc.bearish += strength,
            }
            acc.count += 1;
            acc
        })
    }

    pub fn total(&self) -> f64 {
        self.bullish + self.bearish
    }

    /// Net strength differential between the two directions, capped at 100.
    /// Adding a signal on the stronger side never lowers it.
    pub fn confidence(&self) -> f64 {
        (self.bullish - self.bearish).abs().min(100.0)
    }

    /// Share of total strength held by the stronger direction, 0.5–1.0
    /// (0 for an empty or zero-strength set).
    pub fn dominance(&self) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        self.bullish.max(self.bearish) / total
    }

    /// Share of total strength held by the weaker direction.
    pub fn disagreement(&self) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        self.bullish.min(self.bearish) / total
    }

    /// The stronger direction, `None` on a tie.
    pub fn direction(&self) -> Option<Direction> {
        if self.bullish > self.bearish {
            Some(Direction::Bullish)
        } else if self.bearish > self.bullish {
            Some(Direction::Bearish)
        } else {
            None
        }
    }
}

/// Risk of acting on a directional call: low confidence and disagreeing
/// signals both raise it.
pub fn signal_risk(agg: &Aggregate) -> f64 {
    (0.7 * (100.0 - agg.confidence()) + 30.0 * agg.disagreement()).clamp(0.0, 100.0)
}

const YIELD_BASE_RISK: f64 = 20.0;
const APY_PENALTY_PER_POINT: f64 = 1.5;
const APY_PENALTY_CAP: f64 = 60.0;
/// Pools below this TVL (USD) get no liquidity discount.
const TVL_DISCOUNT_FLOOR: f64 = 100_000.0;
const TVL_DISCOUNT_PER_DECADE: f64 = 5.0;
const TVL_DISCOUNT_CAP: f64 = 20.0;
const SIGNAL_ADJUSTMENT_CAP: f64 = 15.0;

/// Risk of a yield position. Never decreases as `apy` (percent) rises and
/// never increases as `tvl` (USD) rises. Extra signals shift the score by at
/// most ±15: bearish sentiment raises it, bullish lowers it.
pub fn yield_risk(apy: f64, tvl: f64, extra: &Aggregate) -> f64 {
    let apy = if apy.is_finite() { apy.max(0.0) } else { 0.0 };
    let tvl = if tvl.is_finite() { tvl.max(0.0) } else { 0.0 };

    let apy_penalty = (apy * APY_PENALTY_PER_POINT).min(APY_PENALTY_CAP);
    let decades = (tvl.max(1.0) / TVL_DISCOUNT_FLOOR).log10().max(0.0);
    let tvl_discount = (decades * TVL_DISCOUNT_PER_DECADE).min(TVL_DISCOUNT_CAP);

    let adjustment = if extra.count == 0 {
        0.0
    } else {
        ((extra.bearish - extra.bullish) / extra.count as f64 * 0.15)
            .clamp(-SIGNAL_ADJUSTMENT_CAP, SIGNAL_ADJUSTMENT_CAP)
    };

    (YIELD_BASE_RISK + apy_penalty - tvl_discount + adjustment).clamp(0.0, 100.0)
}
