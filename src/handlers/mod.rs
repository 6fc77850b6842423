pub mod config;
pub mod session;

pub use config::*;
pub use session::*;
