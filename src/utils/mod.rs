pub mod error;

pub use error::{AppError, FetchError, ParseError, PoolExhausted, Result, TerminalFailure};
