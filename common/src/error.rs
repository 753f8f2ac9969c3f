use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RelayError {
    #[error("called {uri} got {reason}")]
    Transport { uri: String, reason: String },
    #[error("called {uri} got {status} {body}")]
    Protocol {
        uri: String,
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HeaterError {
    #[error("invalid target {requested}: must be between 0 and {max}")]
    InvalidTarget { requested: i64, max: usize },
}
