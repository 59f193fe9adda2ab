pub mod adapter;
#[cfg(unix)]
pub mod bridge;
pub mod config;
pub mod detector;
pub mod health;
pub mod monitor;
pub mod reader;
pub mod source;
pub mod transport;
pub mod writer;

pub use adapter::RingAdapter;
pub use config::{ClientConfig, ClientSettings};
pub use health::{EndpointStatus, FailureClass, HealthTracker};
pub use reader::ObjectReader;
pub use source::{BytesSource, FileSource};
pub use writer::{ObjectWriter, WriteState};
