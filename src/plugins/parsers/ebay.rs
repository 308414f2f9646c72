use scraper::Html;

use crate::models::Marketplace;
use crate::plugins::traits::parser::{first_attr, first_text, MarketplaceParser};

pub struct EbayParser;

impl MarketplaceParser for EbayParser {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Ebay
    }

    fn price_selectors(&self) -> &'static [&'static str] {
        &[
            ".x-price-primary .ux-textspans",
            ".x-price-primary",
            "#prcIsum",
            "#mm-saleDscPrc",
            "#prcIsum_bidPrice",
        ]
    }

    fn title_selectors(&self) -> &'static [&'static str] {
        &[
            "h1.x-item-title__mainTitle .ux-textspans",
            "h1.x-item-title__mainTitle",
            "#itemTitle",
            "h1.it-ttl",
        ]
    }

    fn image_selectors(&self) -> &'static [(&'static str, &'static str)] {
        &[
            (".ux-image-carousel-item.active img", "src"),
            (".ux-image-carousel-item img", "src"),
            ("#icImg", "src"),
            ("meta[property='og:image']", "content"),
        ]
    }

    fn stock_selectors(&self) -> &'static [&'static str] {
        &[
            ".d-quantity__availability",
            "#qtySubTxt",
            ".ux-message-banner",
            ".d-statusmessage",
            "#msgPanel",
        ]
    }

    fn out_of_stock_markers(&self) -> &'static [&'static str] {
        &["out of stock", "sold out", "this listing has ended", "no longer available"]
    }

    /// Structured-data price is the last resort; it carries no currency symbol.
    fn price_text(&self, doc: &Html) -> Option<String> {
        first_text(doc, self.price_selectors())
            .or_else(|| first_attr(doc, &[("[itemprop='price']", "content")]))
    }

    /// Older item pages prefix the title with a hidden "Details about" label.
    fn title(&self, doc: &Html) -> Option<String> {
        first_text(doc, self.title_selectors()).map(|title| {
            title
                .strip_prefix("Details about")
                .map(|rest| rest.trim().to_string())
                .unwrap_or(title)
        })
    }
}
