use thiserror::Error;

/// Nextcode client error types
#[derive(Error, Debug)]
pub enum NextcodeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parsing failed: {0}")]
    Url(#[from] url::ParseError),

    #[error("I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Raised when the server answered with a non-success status
    #[error("{}", server_display(.message, .url))]
    Server {
        status: Option<u16>,
        message: String,
        url: Option<String>,
        response: Option<serde_json::Value>,
    },

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Query error: {message}")]
    Query {
        message: String,
        query_id: Option<i64>,
    },

    #[error("MissingRelations: {}", .0.join(", "))]
    MissingRelations(Vec<String>),

    #[error("Job error: {message}")]
    Job {
        message: String,
        job_id: Option<i64>,
    },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
}

fn server_display(message: &str, url: &Option<String>) -> String {
    match url {
        Some(url) => format!("{} - {}", message, url),
        None => message.to_string(),
    }
}

/// Result type for Nextcode operations
pub type NextcodeResult<T> = Result<T, NextcodeError>;

impl NextcodeError {
    /// Create a server error without an HTTP response attached
    pub fn server(message: impl Into<String>) -> Self {
        Self::Server {
            status: None,
            message: message.into(),
            url: None,
            response: None,
        }
    }

    /// Create a server error from a failed HTTP response
    pub fn api_error(
        status: u16,
        message: impl Into<String>,
        url: impl Into<String>,
        response: Option<serde_json::Value>,
    ) -> Self {
        Self::Server {
            status: Some(status),
            message: message.into(),
            url: Some(url.into()),
            response,
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            query_id: None,
        }
    }

    /// Create a job error
    pub fn job(message: impl Into<String>) -> Self {
        Self::Job {
            message: message.into(),
            job_id: None,
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::InvalidParameter(message.into())
    }

    /// HTTP status of a server error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Server { status, .. } => *status,
            Self::Http(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// JSON body returned with a server error, if any
    pub fn response(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Server { response, .. } => response.as_ref(),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for NextcodeError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for NextcodeError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_includes_url() {
        let err = NextcodeError::api_error(404, "Not there (code 404)", "https://x/y", None);
        assert_eq!(err.to_string(), "Not there (code 404) - https://x/y");
        assert_eq!(err.status(), Some(404));

        let err = NextcodeError::server("Could not reach server");
        assert_eq!(err.to_string(), "Could not reach server");
        assert_eq!(err.status(), None);
    }

    #[test]
    fn missing_relations_lists_names() {
        let err = NextcodeError::MissingRelations(vec!["[a]".into(), "[b]".into()]);
        assert_eq!(err.to_string(), "MissingRelations: [a], [b]");
    }
}
