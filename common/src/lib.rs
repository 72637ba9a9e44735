pub mod config;
pub mod error;
pub mod types;

pub use config::{parse_locators, MembershipConfig};
pub use error::{GridError, Result};
pub use types::*;
