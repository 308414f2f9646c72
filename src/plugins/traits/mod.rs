pub mod notifier;
pub mod parser;

pub use notifier::Notifier;
pub use parser::{Extraction, MarketplaceParser};
