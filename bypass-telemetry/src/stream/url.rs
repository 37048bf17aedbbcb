//! Socket address of the backend's log stream, derived from the origin the
//! control panel is served from.

use thiserror::Error;
use url::Url;

pub const LOG_SOCKET_PATH: &str = "/api/ws/logs";
pub const DEFAULT_ORIGIN: &str = "http://localhost:8080";

#[derive(Error, Debug)]
pub enum UrlError {
    #[error("invalid origin `{origin}`: {source}")]
    Invalid {
        origin: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported origin scheme `{0}`, expected http or https")]
    UnsupportedScheme(String),
}

/// `http://host[:port]` becomes `ws://host[:port]/api/ws/logs`, `https`
/// becomes `wss`. Socket schemes are accepted as-is.
pub fn socket_url(origin: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(origin.trim()).map_err(|source| UrlError::Invalid {
        origin: origin.to_string(),
        source,
    })?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(UrlError::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| UrlError::UnsupportedScheme(url.scheme().to_string()))?;
    url.set_path(LOG_SOCKET_PATH);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}
