pub mod agent;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod store;
pub mod transport;
pub mod version;

pub use error::{FabricError, Result};
