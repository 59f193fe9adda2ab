//! Object identities and the storage keys derived from them.
//!
//! A key is the SHA-1 of `namespace/collection/name`. Namespaces and
//! collections may not contain `/`, so the joined form (and therefore the
//! digest input) is unique per identity.

use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};

use crate::error::StoreError;

pub const STORAGE_KEY_LEN: usize = 20;

/// The host's account/container/object triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectIdentity {
    namespace: String,
    collection: String,
    name: String,
}

impl ObjectIdentity {
    pub fn new(
        namespace: impl Into<String>,
        collection: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let identity = Self {
            namespace: namespace.into(),
            collection: collection.into(),
            name: name.into(),
        };
        identity.validate()?;
        Ok(identity)
    }

    fn validate(&self) -> Result<(), StoreError> {
        for (field, value) in [
            ("namespace", &self.namespace),
            ("collection", &self.collection),
            ("name", &self.name),
        ] {
            if value.is_empty() {
                return Err(StoreError::InvalidRequest(format!("{field} must not be empty")));
            }
        }
        if self.namespace.contains('/') {
            return Err(StoreError::InvalidRequest(format!(
                "namespace must not contain '/': {}",
                self.namespace
            )));
        }
        if self.collection.contains('/') {
            return Err(StoreError::InvalidRequest(format!(
                "collection must not contain '/': {}",
                self.collection
            )));
        }
        Ok(())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host-side path, `namespace/collection/name`.
    pub fn path(&self) -> String {
        format!("{}/{}/{}", self.namespace, self.collection, self.name)
    }

    pub fn storage_key(&self) -> StorageKey {
        StorageKey::derive(self)
    }
}

impl fmt::Display for ObjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}/{}", self.namespace, self.collection, self.name)
    }
}

/// 160-bit address of an object in the remote store.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey([u8; STORAGE_KEY_LEN]);

impl StorageKey {
    pub fn derive(identity: &ObjectIdentity) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(identity.namespace.as_bytes());
        hasher.update(b"/");
        hasher.update(identity.collection.as_bytes());
        hasher.update(b"/");
        hasher.update(identity.name.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; STORAGE_KEY_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; STORAGE_KEY_LEN] {
        &self.0
    }

    /// Lowercase hex, used as the final path segment of object URLs.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageKey({})", self.to_hex())
    }
}

impl FromStr for StorageKey {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = hex::decode(s)
            .map_err(|e| StoreError::InvalidRequest(format!("bad storage key '{s}': {e}")))?;
        let bytes: [u8; STORAGE_KEY_LEN] = decoded.try_into().map_err(|_| {
            StoreError::InvalidRequest(format!(
                "storage key must be {} hex characters: {s}",
                STORAGE_KEY_LEN * 2
            ))
        })?;
        Ok(Self(bytes))
    }
}
