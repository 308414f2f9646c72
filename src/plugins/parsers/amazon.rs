use scraper::Html;

use crate::models::Marketplace;
use crate::plugins::traits::parser::{first_text, MarketplaceParser};

pub struct AmazonParser;

impl MarketplaceParser for AmazonParser {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Amazon
    }

    fn price_selectors(&self) -> &'static [&'static str] {
        &[
            "#corePrice_feature_div .a-offscreen",
            "#corePriceDisplay_desktop_feature_div .a-offscreen",
            "#priceblock_dealprice",
            "#priceblock_ourprice",
            ".a-price .a-offscreen",
        ]
    }

    fn title_selectors(&self) -> &'static [&'static str] {
        &["#productTitle", "#title"]
    }

    fn image_selectors(&self) -> &'static [(&'static str, &'static str)] {
        &[
            ("#landingImage", "data-old-hires"),
            ("#landingImage", "src"),
            ("#imgBlkFront", "src"),
        ]
    }

    fn stock_selectors(&self) -> &'static [&'static str] {
        &["#availability", "#outOfStock"]
    }

    fn out_of_stock_markers(&self) -> &'static [&'static str] {
        &["currently unavailable", "out of stock", "temporarily out of stock"]
    }

    /// Some layouts only render the visible split price (`.a-price-whole` + `.a-price-fraction`).
    fn price_text(&self, doc: &Html) -> Option<String> {
        first_text(doc, self.price_selectors()).or_else(|| {
            let whole = first_text(doc, &[".a-price-whole"])?;
            let whole = whole.trim_end_matches('.');
            let fraction = first_text(doc, &[".a-price-fraction"]).unwrap_or_else(|| "00".to_string());
            let symbol = first_text(doc, &[".a-price-symbol"]).unwrap_or_default();
            Some(format!("{}{}.{}", symbol, whole, fraction))
        })
    }
}
