use scraper::{Html, Selector};

use crate::models::Marketplace;

/// Raw, un-normalized fields pulled out of one marketplace page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub price_text: Option<String>,
    pub title: Option<String>,
    pub image_url: Option<String>,
    pub out_of_stock: bool,
}

/// Extraction capability implemented once per marketplace. Implementors only describe
/// where things live in their markup; the shared defaults do the walking.
pub trait MarketplaceParser: Send + Sync {
    fn marketplace(&self) -> Marketplace;

    /// Tried in order; the first non-empty match wins.
    fn price_selectors(&self) -> &'static [&'static str];
    fn title_selectors(&self) -> &'static [&'static str];
    /// `(selector, attribute)` pairs.
    fn image_selectors(&self) -> &'static [(&'static str, &'static str)];
    /// Elements whose text carries availability wording.
    fn stock_selectors(&self) -> &'static [&'static str];
    /// Lowercase phrases that mean "not purchasable right now".
    fn out_of_stock_markers(&self) -> &'static [&'static str];

    /// Element a driven browser should wait for before capturing the page.
    fn ready_selector(&self) -> Option<&'static str> {
        None
    }

    fn price_text(&self, doc: &Html) -> Option<String> {
        first_text(doc, self.price_selectors())
    }

    fn title(&self, doc: &Html) -> Option<String> {
        first_text(doc, self.title_selectors())
    }

    fn image_url(&self, doc: &Html) -> Option<String> {
        first_attr(doc, self.image_selectors()).and_then(|src| absolutize_image(&src))
    }

    /// Fail-open: only an explicit out-of-stock signal counts.
    fn is_out_of_stock(&self, doc: &Html) -> bool {
        let markers = self.out_of_stock_markers();
        self.stock_selectors()
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .flat_map(|selector| doc.select(&selector).map(|el| collapse_whitespace(&el.text().collect::<String>())).collect::<Vec<_>>())
            .any(|text| {
                let text = text.to_lowercase();
                markers.iter().any(|marker| text.contains(marker))
            })
    }

    fn extract(&self, doc: &Html) -> Extraction {
        Extraction {
            price_text: self.price_text(doc),
            title: self.title(doc),
            image_url: self.image_url(doc),
            out_of_stock: self.is_out_of_stock(doc),
        }
    }
}

/// Text of the first element matching any of `selectors` that has visible text.
pub fn first_text(doc: &Html, selectors: &[&str]) -> Option<String> {
    selectors
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| {
            doc.select(&selector)
                .map(|el| collapse_whitespace(&el.text().collect::<String>()))
                .find(|text| !text.is_empty())
        })
}

/// Attribute value of the first element matching any `(selector, attribute)` pair.
pub fn first_attr(doc: &Html, selectors: &[(&str, &str)]) -> Option<String> {
    selectors.iter().find_map(|(s, attr)| {
        let selector = Selector::parse(s).ok()?;
        doc.select(&selector)
            .filter_map(|el| el.value().attr(attr))
            .map(str::trim)
            .find(|value| !value.is_empty())
            .map(str::to_string)
    })
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn absolutize_image(src: &str) -> Option<String> {
    if src.starts_with("data:") {
        None
    } else if let Some(rest) = src.strip_prefix("//") {
        Some(format!("https://{}", rest))
    } else {
        Some(src.to_string())
    }
}
