pub mod attrs;
pub mod config;
pub mod error;
pub mod events;

pub use attrs::{Attributes, NodeType};
pub use config::Options;
pub use error::{Error, Result};
pub use events::{Event, EventPublisher};
