use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("Malformed payload: field '{field}' {reason}")]
    MalformedPayload { field: String, reason: String },
}

impl PayloadError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MalformedPayload {
            field: field.into(),
            reason: "is missing".to_string(),
        }
    }

    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write to {table} failed: {message}")]
    Write { table: String, message: String },
    #[error("Lookup of block '{block_id}' failed: {message}")]
    Lookup { block_id: String, message: String },
    #[error("Query failed: {message}")]
    Query { message: String },
    #[error("Store operation '{operation}' timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
    #[error("Failed to serialize row: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn write(table: &str, message: impl ToString) -> Self {
        Self::Write {
            table: table.to_string(),
            message: message.to_string(),
        }
    }

    pub fn lookup(block_id: &str, message: impl ToString) -> Self {
        Self::Lookup {
            block_id: block_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn query(message: impl ToString) -> Self {
        Self::Query {
            message: message.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    #[error("Block window is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid config value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}
