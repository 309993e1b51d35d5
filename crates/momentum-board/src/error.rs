#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("invalid board url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("failed to build board http client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },
    #[error("board request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("board api error (status {status}): {message}")]
    Api { status: u16, message: String },
    #[error("failed to decode board response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl BoardError {
    /// HTTP status for API errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed subscriber is already running")]
    AlreadyRunning,
    #[error("invalid feed url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("unexpected status code: {status}")]
    Status { status: u16 },
    #[error("feed read failed: {source}")]
    Read {
        #[source]
        source: reqwest::Error,
    },
    #[error("connection closed by server")]
    Closed,
    #[error("feed connection abandoned: subscriber stopping")]
    Cancelled,
    #[error("failed to start feed runtime: {source}")]
    Runtime {
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_reports_status_and_message() {
        let err = BoardError::Api {
            status: 404,
            message: "task not found".to_string(),
        };
        assert_eq!(err.to_string(), "board api error (status 404): task not found");
        assert_eq!(err.status(), Some(404));
    }

    #[test]
    fn closed_feed_has_stable_message() {
        assert_eq!(FeedError::Closed.to_string(), "connection closed by server");
        assert_eq!(
            FeedError::Status { status: 502 }.to_string(),
            "unexpected status code: 502"
        );
        assert_eq!(
            FeedError::Cancelled.to_string(),
            "feed connection abandoned: subscriber stopping"
        );
    }
}
