//! Object metadata carried as HTTP headers.
//!
//! Each entry becomes one header: the name is `x-scal-meta-` followed by the
//! hex of the key's UTF-8 bytes (header names are case-insensitive and
//! restricted to token characters, hex survives both), the value is the
//! percent-encoded value bytes. Values are raw bytes, not text; decoding is
//! the exact inverse for any byte string.

use std::collections::BTreeMap;

use crate::error::StoreError;

pub type Metadata = BTreeMap<String, Vec<u8>>;

pub const META_HEADER_PREFIX: &str = "x-scal-meta-";
pub const MAX_METADATA_ENTRIES: usize = 64;
pub const MAX_METADATA_BYTES: usize = 8 * 1024;

/// Metadata key the host uses for the object size.
pub const CONTENT_LENGTH_KEY: &str = "Content-Length";

pub fn header_name(key: &str) -> String {
    format!("{}{}", META_HEADER_PREFIX, hex::encode(key.as_bytes()))
}

/// Encode metadata into `(header name, header value)` pairs.
///
/// Fails with `InvalidRequest` on empty keys or when the encoded set exceeds
/// the header size limits.
pub fn encode_metadata(metadata: &Metadata) -> Result<Vec<(String, String)>, StoreError> {
    if metadata.len() > MAX_METADATA_ENTRIES {
        return Err(StoreError::InvalidRequest(format!(
            "too many metadata entries: {} (max {})",
            metadata.len(),
            MAX_METADATA_ENTRIES
        )));
    }

    let mut total = 0;
    let mut headers = Vec::with_capacity(metadata.len());
    for (key, value) in metadata {
        if key.is_empty() {
            return Err(StoreError::InvalidRequest("metadata key must not be empty".into()));
        }
        let name = header_name(key);
        let value = urlencoding::encode_binary(value).into_owned();
        total += name.len() + value.len();
        headers.push((name, value));
    }

    if total > MAX_METADATA_BYTES {
        return Err(StoreError::InvalidRequest(format!(
            "encoded metadata is {total} bytes (max {MAX_METADATA_BYTES})"
        )));
    }
    Ok(headers)
}

/// Decode metadata from response headers, ignoring unrelated headers.
///
/// A metadata header whose name cannot be decoded means the stored object
/// does not match what this adapter writes; that is reported as an integrity
/// failure. Values always decode.
pub fn decode_metadata<'a, I>(headers: I) -> Result<Metadata, StoreError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut metadata = Metadata::new();
    for (name, value) in headers {
        let Some(encoded_key) = strip_prefix_ignore_case(name, META_HEADER_PREFIX) else {
            continue;
        };
        let key_bytes = hex::decode(encoded_key).map_err(|e| {
            StoreError::IntegrityFailure(format!("undecodable metadata header {name}: {e}"))
        })?;
        let key = String::from_utf8(key_bytes).map_err(|e| {
            StoreError::IntegrityFailure(format!("metadata key in {name} is not UTF-8: {e}"))
        })?;
        metadata.insert(key, urlencoding::decode_binary(value).into_owned());
    }
    Ok(metadata)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s.is_char_boundary(prefix.len()) {
        let (head, tail) = s.split_at(prefix.len());
        if head.eq_ignore_ascii_case(prefix) {
            return Some(tail);
        }
    }
    None
}

/// The object size declared by the host, if any.
pub fn declared_length(metadata: &Metadata) -> Result<Option<u64>, StoreError> {
    let Some(raw) = metadata.get(CONTENT_LENGTH_KEY) else {
        return Ok(None);
    };
    std::str::from_utf8(raw)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| {
            StoreError::InvalidRequest(format!(
                "{CONTENT_LENGTH_KEY} is not a number: {}",
                String::from_utf8_lossy(raw)
            ))
        })
}
