//! Error types for the topicrpc library

use crate::message::RpcError;
use thiserror::Error;

/// Main error type for topicrpc operations
#[derive(Error, Debug)]
pub enum Error {
    /// Transport layer errors
    #[error("Transport layer error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection management errors
    #[error("Connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Serialization and deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A correlated call received no response before its deadline
    #[error("Call {method} on '{topic}' (id {id}) exceeded its deadline after {elapsed_ms}ms")]
    Timeout {
        topic: String,
        method: String,
        id: u32,
        elapsed_ms: u64,
    },

    /// Error object returned by the remote peer
    #[error("Remote error: {0}")]
    Remote(RpcError),

    /// A service is already bound to this topic
    #[error("Topic '{topic}' already has a registered service")]
    DuplicateTopic { topic: String },

    /// The receiver exposes nothing callable
    #[error("Service '{service}' exports no eligible methods")]
    NoEligibleMethods { service: String },

    /// Schema declares methods the receiver does not implement
    #[error("Schema '{schema}' declares methods not exported on '{topic}': {missing:?}")]
    SchemaMismatch {
        schema: String,
        topic: String,
        missing: Vec<String>,
    },

    /// Service registration and discovery errors
    #[error("No service registered on topic '{topic}'")]
    ServiceNotFound { topic: String },

    /// Method invocation errors
    #[error("Method '{method}' not found on topic '{topic}'")]
    MethodNotFound { topic: String, method: String },

    /// Event payload rejected by its schema
    #[error("Event '{event}' failed validation: {}", violations.join("; "))]
    Validation {
        event: String,
        violations: Vec<String>,
    },

    /// The schema validator itself failed
    #[error("Schema error: {message}")]
    Schema {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Topic pattern validation errors
    #[error("Invalid topic pattern: {pattern}")]
    InvalidTopicPattern { pattern: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// Runtime errors
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl Error {
    /// Create a transport error with source
    pub fn transport<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a transport error without source
    pub fn transport_msg(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error without source
    pub fn connection_msg(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a serialization error with source
    pub fn serialization<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Serialization {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a serialization error without source
    pub fn serialization_msg(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
            source: None,
        }
    }

    /// Create a call deadline error
    pub fn timeout(
        topic: impl Into<String>,
        method: impl Into<String>,
        id: u32,
        elapsed: std::time::Duration,
    ) -> Self {
        Self::Timeout {
            topic: topic.into(),
            method: method.into(),
            id,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn duplicate_topic(topic: impl Into<String>) -> Self {
        Self::DuplicateTopic {
            topic: topic.into(),
        }
    }

    pub fn no_eligible_methods(service: impl Into<String>) -> Self {
        Self::NoEligibleMethods {
            service: service.into(),
        }
    }

    pub fn schema_mismatch(
        schema: impl Into<String>,
        topic: impl Into<String>,
        missing: Vec<String>,
    ) -> Self {
        Self::SchemaMismatch {
            schema: schema.into(),
            topic: topic.into(),
            missing,
        }
    }

    /// Create a service not found error
    pub fn service_not_found(topic: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            topic: topic.into(),
        }
    }

    /// Create a method not found error
    pub fn method_not_found(topic: impl Into<String>, method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            topic: topic.into(),
            method: method.into(),
        }
    }

    pub fn validation(event: impl Into<String>, violations: Vec<String>) -> Self {
        Self::Validation {
            event: event.into(),
            violations,
        }
    }

    /// Create a schema validator error with source
    pub fn schema<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Schema {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a schema validator error without source
    pub fn schema_msg(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            source: None,
        }
    }

    /// Create an invalid topic pattern error
    pub fn invalid_topic_pattern(pattern: impl Into<String>) -> Self {
        Self::InvalidTopicPattern {
            pattern: pattern.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            field,
        }
    }

    /// Create a runtime error with source
    pub fn runtime<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Runtime {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a runtime error without source
    pub fn runtime_msg(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Connection { .. } => true,
            Error::Timeout { .. } => true,
            Error::Runtime { .. } => true,
            Error::Io { .. } => true,
            Error::Schema { .. } => true,
            Error::Remote(_) => false,
            Error::Serialization { .. } => false,
            Error::DuplicateTopic { .. } => false,
            Error::NoEligibleMethods { .. } => false,
            Error::SchemaMismatch { .. } => false,
            Error::ServiceNotFound { .. } => false,
            Error::MethodNotFound { .. } => false,
            Error::Validation { .. } => false,
            Error::InvalidTopicPattern { .. } => false,
            Error::Configuration { .. } => false,
        }
    }

    /// Get error category for debugging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Transport { .. } => "transport",
            Error::Connection { .. } => "connection",
            Error::Serialization { .. } => "serialization",
            Error::Timeout { .. } => "timeout",
            Error::Remote(_) => "remote",
            Error::DuplicateTopic { .. } => "registration",
            Error::NoEligibleMethods { .. } => "registration",
            Error::SchemaMismatch { .. } => "registration",
            Error::ServiceNotFound { .. } => "service_resolution",
            Error::MethodNotFound { .. } => "method_resolution",
            Error::Validation { .. } => "validation",
            Error::Schema { .. } => "schema",
            Error::InvalidTopicPattern { .. } => "topic_validation",
            Error::Configuration { .. } => "configuration",
            Error::Io { .. } => "io",
            Error::Runtime { .. } => "runtime",
        }
    }

    /// True for errors raised while binding a service to a topic
    pub fn is_registration(&self) -> bool {
        self.category() == "registration"
    }
}

// Implement From traits for common error types
impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization("JSON serialization failed", err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::runtime("Task join failed", err)
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        Error::Remote(err)
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::runtime_msg(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::runtime_msg(msg.to_string())
    }
}

/// Result type for topicrpc operations
pub type Result<T> = std::result::Result<T, Error>;
