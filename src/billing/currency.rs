//! Fixed-point monetary amounts.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use super::BillingError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "USD")]
    UsDollars,
    /// Micro-dollars, the unit balances and transactions are stored in.
    #[serde(rename = "USDMicro")]
    UsDollarsMicro,
}

impl Currency {
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::UsDollars => "USD",
            Self::UsDollarsMicro => "USDMicro",
        }
    }

    pub fn decimal_places(&self) -> u32 {
        match self {
            Self::UsDollars => 2,
            Self::UsDollarsMicro => 6,
        }
    }

    pub fn zero(self) -> Amount {
        Amount::from_base_units(0, self)
    }
}

impl FromStr for Currency {
    type Err = BillingError;

    fn from_str(symbol: &str) -> Result<Self, Self::Err> {
        match symbol {
            "USD" => Ok(Self::UsDollars),
            "USDMicro" => Ok(Self::UsDollarsMicro),
            other => Err(BillingError::InvalidAmount(format!(
                "unknown currency {other:?}"
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Amount {
    base_units: i64,
    currency: Currency,
}

impl Amount {
    pub fn from_base_units(base_units: i64, currency: Currency) -> Self {
        Self {
            base_units,
            currency,
        }
    }

    /// Truncates toward zero to the currency's precision; never rounds up.
    pub fn from_decimal(value: Decimal, currency: Currency) -> Result<Self, BillingError> {
        let places = currency.decimal_places();
        let truncated = value.round_dp_with_strategy(places, RoundingStrategy::ToZero);
        let base_units = truncated
            .checked_mul(Decimal::from(10_i64.pow(places)))
            .and_then(|units| units.to_i64())
            .ok_or_else(|| {
                BillingError::InvalidAmount(format!("{value} {} overflows", currency.symbol()))
            })?;
        Ok(Self::from_base_units(base_units, currency))
    }

    pub fn base_units(&self) -> i64 {
        self.base_units
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn as_decimal(&self) -> Decimal {
        Decimal::new(self.base_units, self.currency.decimal_places())
    }

    pub fn convert_truncating(&self, currency: Currency) -> Result<Self, BillingError> {
        Self::from_decimal(self.as_decimal(), currency)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_decimal(), self.currency.symbol())
    }
}
