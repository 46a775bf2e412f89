use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArmError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("{method} {url}: {message}")]
    Transport {
        method: String,
        url: String,
        message: String,
    },

    #[error("{context}: status {status}: {message}")]
    Rejected {
        context: String,
        status: u16,
        message: String,
    },

    #[error("long-running operation {url} still pending after {polls} polls")]
    OperationTimeout { url: String, polls: usize },

    #[error("internal client error: {0}")]
    Internal(String),
}
