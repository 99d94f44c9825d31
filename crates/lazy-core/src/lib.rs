pub mod error;
pub mod filter;
pub mod parser;
pub mod record;

pub use error::{CoreError, CoreReason, CoreResult};
pub use filter::{Filter, FilterError};
pub use parser::LogParser;
pub use record::{RawRecord, Record, Value};
