use std::io;

use thiserror::Error;

/// Failure to load a remote feed (proxy list or KV registry).
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream returned HTTP {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl From<worker::Error> for FetchError {
    fn from(e: worker::Error) -> Self {
        FetchError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Malformed(e.to_string())
    }
}

/// Failure of the external subscription converter.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("converter unreachable: {0}")]
    Transport(String),
    #[error("converter returned HTTP {0}")]
    Status(u16),
    #[error("cannot encode converter request: {0}")]
    Encode(String),
}

impl ConversionError {
    /// HTTP status reported back to the subscription caller.
    pub fn status_code(&self) -> u16 {
        match self {
            ConversionError::Status(code) if *code >= 400 => *code,
            ConversionError::Status(_) | ConversionError::Transport(_) => 502,
            ConversionError::Encode(_) => 500,
        }
    }
}

impl From<worker::Error> for ConversionError {
    fn from(e: worker::Error) -> Self {
        ConversionError::Transport(e.to_string())
    }
}

/// Terminal failure of a single tunnel session.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("cannot resolve target: {0}")]
    Resolution(String),
    #[error("dial {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("relay error: {0}")]
    Relay(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_status_passes_client_and_server_errors_through() {
        assert_eq!(ConversionError::Status(429).status_code(), 429);
        assert_eq!(ConversionError::Status(503).status_code(), 503);
        // a redirect or other non-success below 400 is still a gateway failure
        assert_eq!(ConversionError::Status(302).status_code(), 502);
        assert_eq!(ConversionError::Transport("reset".into()).status_code(), 502);
    }

    #[test]
    fn dial_error_names_target() {
        let err = TunnelError::Dial {
            target: "1.2.3.4:443".into(),
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert_eq!(err.to_string(), "dial 1.2.3.4:443 failed: refused");
    }
}
