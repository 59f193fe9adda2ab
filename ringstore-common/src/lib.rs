pub mod backend;
pub mod endpoint;
pub mod error;
pub mod identity;
pub mod metadata;

pub use backend::{ByteRange, ObjectBackend, ObjectRead, ObjectSource, ObjectWrite};
pub use endpoint::{Endpoint, EndpointError};
pub use error::StoreError;
pub use identity::{ObjectIdentity, StorageKey};
pub use metadata::Metadata;
