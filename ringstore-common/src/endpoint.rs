use std::fmt;

use url::Url;

use crate::identity::StorageKey;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointError {
    #[error("invalid endpoint URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("unsupported endpoint scheme '{0}' (expected http or https)")]
    UnsupportedScheme(String),
    #[error("endpoint URL can't have query values: {0}")]
    HasQuery(String),
    #[error("endpoint URL can't have a fragment: {0}")]
    HasFragment(String),
    #[error("endpoint URL can't carry credentials: {0}")]
    HasCredentials(String),
}

/// One reachable instance of the remote store.
///
/// `http://10.0.0.1:81/proxy/chord/` is split into the base URL
/// `http://10.0.0.1:81` and the path prefix `/proxy/chord`; objects live at
/// `{base}{prefix}/{key}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    base_url: String,
    path_prefix: String,
    scheme: String,
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, EndpointError> {
        let url = Url::parse(raw.trim()).map_err(|e| EndpointError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            return Err(EndpointError::UnsupportedScheme(scheme));
        }
        if url.query().is_some() {
            return Err(EndpointError::HasQuery(raw.to_string()));
        }
        if url.fragment().is_some() {
            return Err(EndpointError::HasFragment(raw.to_string()));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(EndpointError::HasCredentials(raw.to_string()));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| EndpointError::InvalidUrl {
                url: raw.to_string(),
                reason: "missing host".into(),
            })?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);
        let path_prefix = url.path().trim_end_matches('/').to_string();

        Ok(Self {
            base_url: format!("{scheme}://{host}:{port}"),
            path_prefix,
            scheme,
            host,
            port,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Path prefix without a trailing slash; empty when objects live at the root.
    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn is_plain_http(&self) -> bool {
        self.scheme == "http"
    }

    /// Host as it appears in a URL (IPv6 addresses keep their brackets).
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`, suitable for `ToSocketAddrs` and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn object_path(&self, key: &StorageKey) -> String {
        format!("{}/{}", self.path_prefix, key)
    }

    pub fn object_url(&self, key: &StorageKey) -> String {
        format!("{}{}", self.base_url, self.object_path(key))
    }

    /// Location of the store's active configuration, used for health probes.
    pub fn conf_url(&self) -> String {
        format!("{}{}/.conf", self.base_url, self.path_prefix)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base_url, self.path_prefix)
    }
}
