use std::fmt;
use url::Url;

use super::PlatformError;

/// Validated platform endpoint: scheme, host and optional port.
///
/// Any path on the input (such as a trailing `/sdk`) is dropped; the REST
/// client builds its own paths from the base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    /// Parses a URL-shaped endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`PlatformError::InvalidEndpoint`] when the input is not a URL,
    /// uses a scheme other than http or https, or has no host.
    pub fn parse(raw: &str) -> Result<Self, PlatformError> {
        let raw = raw.trim();
        let url = Url::parse(raw)
            .map_err(|e| PlatformError::InvalidEndpoint(format!("'{raw}': {e}")))?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(PlatformError::InvalidEndpoint(format!(
                "'{raw}': unsupported scheme '{scheme}'"
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| PlatformError::InvalidEndpoint(format!("'{raw}': missing host")))?;

        Ok(Self {
            scheme: scheme.to_string(),
            host: host.to_string(),
            port: url.port(),
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        match self.port {
            Some(port) => format!("{}://{}:{port}", self.scheme, self.host),
            None => format!("{}://{}", self.scheme, self.host),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base_url())
    }
}
