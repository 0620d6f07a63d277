//! Numeric value predicates used by filtering leaves.
//!
//! Bounds are converted to the fixed-point form of the index they are tested
//! against when the predicate is built, so evaluation is pure `i64`
//! comparison and agrees with the index on ordering and equality.

use evita_common::{to_fixed_point, ContentHasher};

use crate::bitmap::PriceRecord;
use crate::error::{EngineError, Result};

const CLASS_ID_AMOUNT_PREDICATE: u64 = 0x5052_4943_455f_5052;

/// Which number the predicate reads from a tested record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueMode {
    WithTax,
    WithoutTax,
    /// The raw indexed value (numeric attributes). Not applicable to prices.
    Raw,
}

impl ValueMode {
    fn tag(self) -> u64 {
        match self {
            ValueMode::WithTax => 1,
            ValueMode::WithoutTax => 2,
            ValueMode::Raw => 3,
        }
    }

    /// Pick the amount a price record holds for this mode.
    pub fn extract_price(self, price: &PriceRecord) -> Option<i64> {
        match self {
            ValueMode::WithTax => Some(price.price_with_tax),
            ValueMode::WithoutTax => Some(price.price_without_tax),
            ValueMode::Raw => None,
        }
    }
}

/// An inclusive `[from, to]` window over fixed-point amounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountPredicate {
    /// Matches everything; never consults the value.
    All,
    Range {
        mode: ValueMode,
        from: Option<i64>,
        to: Option<i64>,
        decimal_places: u32,
    },
}

impl AmountPredicate {
    /// Build a range predicate from decimal literals.
    ///
    /// Both bounds absent collapses to [`AmountPredicate::All`].
    pub fn between(
        mode: ValueMode,
        from: Option<&str>,
        to: Option<&str>,
        decimal_places: u32,
    ) -> Result<Self> {
        if from.is_none() && to.is_none() {
            return Ok(AmountPredicate::All);
        }
        let from = from.map(|v| to_fixed_point(v, decimal_places)).transpose()?;
        let to = to.map(|v| to_fixed_point(v, decimal_places)).transpose()?;
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(EngineError::configuration(format!(
                    "amount range is inverted: from {f} > to {t} (at {decimal_places} places)"
                )));
            }
        }
        Ok(AmountPredicate::Range {
            mode,
            from,
            to,
            decimal_places,
        })
    }

    pub fn is_all(&self) -> bool {
        matches!(self, AmountPredicate::All)
    }

    pub fn mode(&self) -> Option<ValueMode> {
        match self {
            AmountPredicate::All => None,
            AmountPredicate::Range { mode, .. } => Some(*mode),
        }
    }

    pub fn decimal_places(&self) -> Option<u32> {
        match self {
            AmountPredicate::All => None,
            AmountPredicate::Range { decimal_places, .. } => Some(*decimal_places),
        }
    }

    /// Test a lazily extracted value.
    pub fn test(&self, extract: impl FnOnce() -> i64) -> bool {
        match self {
            AmountPredicate::All => true,
            AmountPredicate::Range { from, to, .. } => {
                let value = extract();
                from.map_or(true, |f| value >= f) && to.map_or(true, |t| value <= t)
            }
        }
    }

    pub fn test_price(&self, price: &PriceRecord) -> bool {
        match self {
            AmountPredicate::All => true,
            AmountPredicate::Range { mode, .. } => match mode.extract_price(price) {
                Some(amount) => self.test(|| amount),
                None => false,
            },
        }
    }

    pub fn hash(&self) -> u64 {
        match self {
            AmountPredicate::All => ContentHasher::new(CLASS_ID_AMOUNT_PREDICATE).finish(),
            AmountPredicate::Range {
                mode,
                from,
                to,
                decimal_places,
            } => ContentHasher::new(CLASS_ID_AMOUNT_PREDICATE)
                .long(mode.tag())
                .optional(*from)
                .optional(*to)
                .long(u64::from(*decimal_places))
                .finish(),
        }
    }
}
