pub mod config;
pub mod duration;

pub use config::TopoConfig;
pub use duration::{parse_duration, DurationError};
