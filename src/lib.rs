pub mod archive;
pub mod embedded;
mod error;
pub mod hosts;
pub mod http;
pub mod mega;
pub mod paths;
pub mod runner;
pub mod sheet;
pub mod ytdlp;

pub use error::{EngineError, Result};
