pub mod manager;
pub mod notifiers;
pub mod parsers;
pub mod traits;

pub use manager::PluginManager;
pub use parsers::ParserRegistry;
pub use traits::{MarketplaceParser, Notifier};
