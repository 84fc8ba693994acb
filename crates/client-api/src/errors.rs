//! The request error taxonomy shared by both protocols.
//!
//! A handler fails in one of two ways: a client error (a message meant for
//! the caller, with a 4xx status) or a server error (an internal failure
//! whose details are logged but never leaked; the client always sees the
//! same generic message).

use validana_core::cache::CacheError;

/// What clients see for any internal failure.
pub const GENERIC_ERROR_MESSAGE: &str = "Error occurred during request.";

#[derive(Debug)]
pub enum RequestError {
    Client { status: u16, message: String },
    Server(anyhow::Error),
}

impl RequestError {
    /// A plain client error with the default 400 status.
    pub fn client(message: impl Into<String>) -> RequestError {
        RequestError::Client {
            status: 400,
            message: message.into(),
        }
    }

    pub fn client_with_status(status: u16, message: impl Into<String>) -> RequestError {
        RequestError::Client {
            status,
            message: message.into(),
        }
    }

    pub fn server(error: impl Into<anyhow::Error>) -> RequestError {
        RequestError::Server(error.into())
    }

    pub fn status(&self) -> u16 {
        match self {
            RequestError::Client { status, .. } => *status,
            RequestError::Server(_) => 500,
        }
    }

    /// The message a client is allowed to see.
    pub fn client_message(&self) -> &str {
        match self {
            RequestError::Client { message, .. } => message,
            RequestError::Server(_) => GENERIC_ERROR_MESSAGE,
        }
    }
}

impl From<anyhow::Error> for RequestError {
    fn from(error: anyhow::Error) -> Self {
        RequestError::Server(error)
    }
}

impl From<tokio_postgres::Error> for RequestError {
    fn from(error: tokio_postgres::Error) -> Self {
        RequestError::Server(error.into())
    }
}

impl From<CacheError> for RequestError {
    fn from(error: CacheError) -> Self {
        // The cause was already logged by the cache; the caller gets the
        // generic treatment of an internal failure.
        RequestError::Server(anyhow::Error::new(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_errors_keep_their_message() {
        let err = RequestError::client("No existing blocks found.");
        assert_eq!(err.status(), 400);
        assert_eq!(err.client_message(), "No existing blocks found.");

        let err = RequestError::client_with_status(422, "rejected");
        assert_eq!(err.status(), 422);
    }

    #[test]
    fn server_errors_never_leak_details() {
        let err = RequestError::server(anyhow::anyhow!("password=oops connection refused"));
        assert_eq!(err.status(), 500);
        assert_eq!(err.client_message(), GENERIC_ERROR_MESSAGE);
    }
}
