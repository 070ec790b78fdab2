//! Supported currencies
//!
//! Accounts hold balances in exactly one currency. Conversion is never done
//! inside the ledger: callers must check that both sides of a transfer share
//! a currency before calling the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Currency code of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "EUR")]
    Eur,
    #[serde(rename = "CAD")]
    Cad,
}

impl Currency {
    pub const ALL: [Currency; 3] = [Currency::Usd, Currency::Eur, Currency::Cad];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Cad => "CAD",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown currency code
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unsupported currency: {0}")]
pub struct UnsupportedCurrency(pub String);

impl FromStr for Currency {
    type Err = UnsupportedCurrency;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "CAD" => Ok(Currency::Cad),
            other => Err(UnsupportedCurrency(other.to_string())),
        }
    }
}

/// Check a raw currency code (case-sensitive, as stored)
pub fn is_supported(currency: &str) -> bool {
    currency.parse::<Currency>().is_ok()
}
