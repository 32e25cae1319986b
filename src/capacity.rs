//! Capacity ratios and the discrete symbols shown in the tray.

use crate::state::LimitState;
use crate::types::Dimension;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const FULL_ABOVE: f64 = 0.50;
pub const LOW_BELOW: f64 = 0.20;

/// Capacity bucket for a dimension. Ordered by severity, so `min` is the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacitySymbol {
    Low,
    Partial,
    Full,
}

impl CapacitySymbol {
    pub fn glyph(self) -> &'static str {
        match self {
            CapacitySymbol::Full => "●",
            CapacitySymbol::Partial => "◐",
            CapacitySymbol::Low => "○",
        }
    }
}

/// Glyph for a dimension (or the whole tray) with no usable data.
pub const UNKNOWN_GLYPH: &str = "◉";

/// remaining / limit, with `limit == 0` treated as no capacity.
pub fn ratio(limit: u64, remaining: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    remaining.min(limit) as f64 / limit as f64
}

pub fn symbol_for(ratio: f64) -> CapacitySymbol {
    // NaN falls through both comparisons and lands on Low.
    if ratio > FULL_ABOVE {
        CapacitySymbol::Full
    } else if ratio >= LOW_BELOW {
        CapacitySymbol::Partial
    } else {
        CapacitySymbol::Low
    }
}

/// Worst symbol across the known dimensions; `None` when nothing is known.
pub fn aggregate<I>(symbols: I) -> Option<CapacitySymbol>
where
    I: IntoIterator<Item = Option<CapacitySymbol>>,
{
    symbols.into_iter().flatten().min()
}

/// Per-dimension symbols plus the aggregate for one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityView {
    pub dimensions: BTreeMap<Dimension, Option<CapacitySymbol>>,
    pub aggregate: Option<CapacitySymbol>,
    /// Lowest remaining percentage (0-100) across known dimensions.
    pub min_percent: Option<f64>,
}

impl CapacityView {
    pub fn from_state(state: &LimitState) -> Self {
        let mut dimensions = BTreeMap::new();
        let mut min_ratio: Option<f64> = None;
        for dim in Dimension::ALL {
            let symbol = state.reading(dim).map(|r| {
                let ratio = r.ratio();
                min_ratio = Some(min_ratio.map_or(ratio, |m| m.min(ratio)));
                symbol_for(ratio)
            });
            dimensions.insert(dim, symbol);
        }
        let aggregate = aggregate(dimensions.values().copied());
        Self {
            dimensions,
            aggregate,
            min_percent: min_ratio.map(|r| r * 100.0),
        }
    }

    pub fn symbol(&self, dim: Dimension) -> Option<CapacitySymbol> {
        self.dimensions.get(&dim).copied().flatten()
    }
}
