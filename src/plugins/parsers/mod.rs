pub mod aliexpress;
pub mod amazon;
pub mod ebay;
pub mod price;

pub use aliexpress::AliExpressParser;
pub use amazon::AmazonParser;
pub use ebay::EbayParser;
pub use price::PriceNormalizer;

use chrono::{DateTime, Utc};
use scraper::Html;

use crate::models::{Marketplace, ScrapedRecord};
use crate::plugins::traits::parser::MarketplaceParser;
use crate::utils::error::ParseError;

/// Marketplace -> parser lookup. Every supported marketplace has exactly one parser, so
/// lookup cannot fail for a `Marketplace` value.
pub struct ParserRegistry {
    amazon: AmazonParser,
    ebay: EbayParser,
    aliexpress: AliExpressParser,
    normalizer: PriceNormalizer,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self::with_default_currency(crate::config::defaults::CURRENCY)
    }

    /// `default_currency` applies when the price text carries a bare `$` or no symbol.
    pub fn with_default_currency(default_currency: &str) -> Self {
        Self {
            amazon: AmazonParser,
            ebay: EbayParser,
            aliexpress: AliExpressParser,
            normalizer: PriceNormalizer::with_default_currency(default_currency),
        }
    }

    pub fn parser_for(&self, marketplace: Marketplace) -> &dyn MarketplaceParser {
        match marketplace {
            Marketplace::Amazon => &self.amazon,
            Marketplace::Ebay => &self.ebay,
            Marketplace::AliExpress => &self.aliexpress,
        }
    }

    pub fn parse(&self, marketplace: Marketplace, raw: &str) -> Result<ScrapedRecord, ParseError> {
        self.parse_at(marketplace, raw, Utc::now())
    }

    /// Pure over its inputs: the same page always yields the same record.
    pub fn parse_at(
        &self,
        marketplace: Marketplace,
        raw: &str,
        scraped_at: DateTime<Utc>,
    ) -> Result<ScrapedRecord, ParseError> {
        let doc = Html::parse_document(raw);
        let extraction = self.parser_for(marketplace).extract(&doc);

        let price_text = extraction.price_text.ok_or(ParseError::MissingPrice)?;
        let (price, currency) = self.normalizer.normalize(&price_text)?;

        Ok(ScrapedRecord {
            price,
            currency,
            in_stock: !extraction.out_of_stock,
            title: extraction.title,
            image_url: extraction.image_url,
            scraped_at,
        })
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
