pub mod clock;
pub mod config;
pub mod error;
pub mod models;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::*;
pub use models::*;
