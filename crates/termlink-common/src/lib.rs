pub mod errors;
pub mod id;
pub mod protocol;
pub mod timer;

pub use errors::{ConfigError, ErrorCode, ErrorTaxonomy, TerminalError, TermlinkError};
pub use id::{new_id, next_token};
pub use timer::ScheduledTask;

pub type Result<T> = std::result::Result<T, TermlinkError>;
