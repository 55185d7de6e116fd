use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockflowError {
    // Binding / control flow
    #[error("Inputs exhausted: {0}")]
    InputExhausted(String),

    #[error("Missing required input '{input}' on node '{node}'")]
    MissingInput { node: String, input: String },

    // Interface declaration errors
    #[error("Bad annotation on parameter '{parameter}': {message}")]
    BadAnnotation { parameter: String, message: String },

    #[error("Interface declaration error: {0}")]
    InterfaceDeclaration(String),

    // Conversion errors
    #[error("Conversion not supported: {from} -> {to}")]
    ConversionNotSupported { from: String, to: String },

    // Schema errors
    #[error("Schema conflict on output '{output}': {existing} != {declared}")]
    SchemaConflict {
        output: String,
        existing: String,
        declared: String,
    },

    // Registry errors
    #[error("{kind} not found: {key}")]
    NotFound { kind: String, key: String },

    // Graph errors
    #[error("Graph error: {0}")]
    Graph(String),

    #[error("Graph contains a cycle through: {0}")]
    GraphCycle(String),

    // Storage errors
    #[error("Storage error: {url}: {message}")]
    Storage { url: String, message: String },

    #[error("Unsupported storage url: {0}")]
    UnsupportedStorage(String),

    // Metadata errors
    #[error("Database error: {0}")]
    Database(String),

    // Run errors
    #[error("Function error in node '{node}': {message}")]
    Function { node: String, message: String },

    #[error("Result handler error: {0}")]
    ResultHandler(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BlockflowError {
    pub fn not_found(kind: &str, key: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            key: key.into(),
        }
    }

    pub fn storage(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Storage {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Exhaustion is a skip signal rather than a failure.
    pub fn is_control_flow(&self) -> bool {
        matches!(self, Self::InputExhausted(_))
    }
}

pub type Result<T> = std::result::Result<T, BlockflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_is_control_flow() {
        assert!(BlockflowError::InputExhausted("all inputs".into()).is_control_flow());
        assert!(!BlockflowError::Graph("dup".into()).is_control_flow());
    }

    #[test]
    fn test_error_messages() {
        let e = BlockflowError::MissingInput {
            node: "accumulate".into(),
            input: "input".into(),
        };
        assert_eq!(
            e.to_string(),
            "Missing required input 'input' on node 'accumulate'"
        );

        let e = BlockflowError::not_found("Function", "core.nope");
        assert_eq!(e.to_string(), "Function not found: core.nope");
    }
}
