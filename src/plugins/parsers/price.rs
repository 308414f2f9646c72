use regex::Regex;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::LazyLock;

use crate::utils::error::ParseError;

static PRICE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(-\s*)?(?:[A-Za-z]{1,3}\s?)?[\$£€¥₹]?\s*(\d[\d,.]*)").expect("price regex is valid")
});

/// Turns marketplace price strings ("$1,299.99", "US $12.50", "12,99 €") into a
/// positive two-place decimal plus an ISO currency code.
pub struct PriceNormalizer {
    currency_symbols: Vec<(&'static str, &'static str)>,
    default_currency: String,
}

impl PriceNormalizer {
    pub fn new() -> Self {
        Self::with_default_currency("USD")
    }

    pub fn with_default_currency(default_currency: &str) -> Self {
        let mut currency_symbols = vec![
            ("US $", "USD"),
            ("US$", "USD"),
            ("USD", "USD"),
            ("AU $", "AUD"),
            ("A$", "AUD"),
            ("AUD", "AUD"),
            ("C $", "CAD"),
            ("C$", "CAD"),
            ("CAD", "CAD"),
            ("£", "GBP"),
            ("GBP", "GBP"),
            ("€", "EUR"),
            ("EUR", "EUR"),
            ("¥", "JPY"),
            ("₹", "INR"),
        ];
        // Check longer currency symbols first (US$ before $)
        currency_symbols.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        Self {
            currency_symbols,
            default_currency: default_currency.to_string(),
        }
    }

    pub fn normalize(&self, text: &str) -> Result<(Decimal, String), ParseError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ParseError::MissingPrice);
        }

        let captures = PRICE_REGEX
            .captures(trimmed)
            .ok_or_else(|| ParseError::InvalidPrice(trimmed.to_string()))?;
        let negative = captures.get(1).is_some();
        let number = captures
            .get(2)
            .map(|m| m.as_str().trim_end_matches(['.', ',']))
            .ok_or_else(|| ParseError::InvalidPrice(trimmed.to_string()))?;

        let amount = Decimal::from_str(&Self::canonical_number(number))
            .map_err(|_| ParseError::InvalidPrice(trimmed.to_string()))?
            .round_dp(2);
        let amount = if negative { -amount } else { amount };

        // Zero means "not available", not a free item
        if amount <= Decimal::ZERO {
            return Err(ParseError::NonPositivePrice(amount));
        }

        Ok((amount, self.extract_currency(trimmed)))
    }

    /// Strip thousands separators and turn a decimal comma into a dot.
    fn canonical_number(number: &str) -> String {
        let last_dot = number.rfind('.');
        let last_comma = number.rfind(',');

        match (last_dot, last_comma) {
            // 1.299,99
            (Some(dot), Some(comma)) if comma > dot => number.replace('.', "").replace(',', "."),
            // 1,299.99
            (Some(_), Some(_)) => number.replace(',', ""),
            (None, Some(comma)) => {
                let fraction_digits = number.len() - comma - 1;
                if fraction_digits == 3 {
                    number.replace(',', "")
                } else {
                    number.replace(',', ".")
                }
            }
            // 1.299.000
            (Some(_), None) if number.matches('.').count() > 1 => number.replace('.', ""),
            _ => number.to_string(),
        }
    }

    fn extract_currency(&self, text: &str) -> String {
        self.currency_symbols
            .iter()
            .find(|(symbol, _)| text.contains(symbol))
            .map(|(_, code)| code.to_string())
            .unwrap_or_else(|| self.default_currency.clone())
    }
}

impl Default for PriceNormalizer {
    fn default() -> Self {
        Self::new()
    }
}
