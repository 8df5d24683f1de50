use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing field '{field}' for message type '{kind}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}
