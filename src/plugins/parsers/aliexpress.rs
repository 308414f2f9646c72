use crate::models::Marketplace;
use crate::plugins::traits::parser::MarketplaceParser;

/// AliExpress pages are client-rendered; the markup here is what the browser fetcher
/// captures after `ready_selector` appears.
pub struct AliExpressParser;

impl MarketplaceParser for AliExpressParser {
    fn marketplace(&self) -> Marketplace {
        Marketplace::AliExpress
    }

    fn price_selectors(&self) -> &'static [&'static str] {
        &[
            ".product-price-value",
            "[class*='price--currentPriceText']",
            ".product-price-current",
            ".uniform-banner-box-price",
        ]
    }

    fn title_selectors(&self) -> &'static [&'static str] {
        &[".product-title-text", "h1[data-pl='product-title']", "h1"]
    }

    fn image_selectors(&self) -> &'static [(&'static str, &'static str)] {
        &[
            (".magnifier-image", "src"),
            ("[class*='magnifier--image']", "src"),
            ("meta[property='og:image']", "content"),
        ]
    }

    fn stock_selectors(&self) -> &'static [&'static str] {
        &[".product-quantity-tip", "[class*='quantity--info']", "[class*='soldout']"]
    }

    fn out_of_stock_markers(&self) -> &'static [&'static str] {
        &["sold out", "out of stock", "no longer available", "currently unavailable"]
    }

    fn ready_selector(&self) -> Option<&'static str> {
        Some("[class*='price'], .product-price-value")
    }
}
