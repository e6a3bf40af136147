//! Error handling for the partflow-common crate.

use thiserror::Error;

/// Common error type that abstracts over underlying library errors.
///
/// Every variant carries a human readable message and an optional source
/// error so that callers can walk the chain with `std::error::Error::source`.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Cache operation failed: {message}")]
    CacheError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Storage operation failed: {message}")]
    StorageError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Serialization failed: {message}")]
    SerializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Deserialization failed: {message}")]
    DeserializationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("IO operation failed: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Compression failed: {message}")]
    CompressionError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Decompression failed: {message}")]
    DecompressionError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Resource not found: {message}")]
    NotFoundError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Internal error: {message}")]
    InternalError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

macro_rules! constructors {
    ($($variant:ident => $plain:ident, $with_source:ident;)*) => {
        impl CommonError {
            $(
                #[doc = concat!("Create a `", stringify!($variant), "` with a custom message.")]
                pub fn $plain<S: Into<String>>(message: S) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: None,
                    }
                }

                #[doc = concat!("Create a `", stringify!($variant), "` with a custom message and source error.")]
                pub fn $with_source<S: Into<String>, E: Into<anyhow::Error>>(
                    message: S,
                    source: E,
                ) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: Some(source.into()),
                    }
                }
            )*
        }
    };
}

constructors! {
    CacheError => cache_error, cache_error_with_source;
    StorageError => storage_error, storage_error_with_source;
    SerializationError => serialization_error, serialization_error_with_source;
    DeserializationError => deserialization_error, deserialization_error_with_source;
    ConfigurationError => configuration_error, configuration_error_with_source;
    IoError => io_error, io_error_with_source;
    CompressionError => compression_error, compression_error_with_source;
    DecompressionError => decompression_error, decompression_error_with_source;
    NotFoundError => not_found_error, not_found_error_with_source;
    InternalError => internal_error, internal_error_with_source;
}

impl CommonError {
    /// The message the error was created with, without the variant prefix.
    pub fn message(&self) -> &str {
        match self {
            CommonError::CacheError { message, .. }
            | CommonError::StorageError { message, .. }
            | CommonError::SerializationError { message, .. }
            | CommonError::DeserializationError { message, .. }
            | CommonError::ConfigurationError { message, .. }
            | CommonError::IoError { message, .. }
            | CommonError::CompressionError { message, .. }
            | CommonError::DecompressionError { message, .. }
            | CommonError::NotFoundError { message, .. }
            | CommonError::InternalError { message, .. } => message,
        }
    }
}

/// Extension methods for attaching context to foreign errors.
pub mod context {
    use super::*;

    /// Convert any error result into a `CommonError` of the matching flavour.
    pub trait ErrorContext<T> {
        fn with_storage_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;

        fn with_io_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;

        fn with_serialization_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;

        fn with_deserialization_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;
    }

    impl<T, E> ErrorContext<T> for std::result::Result<T, E>
    where
        E: Into<anyhow::Error>,
    {
        fn with_storage_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::storage_error_with_source(f(), e))
        }

        fn with_io_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::io_error_with_source(f(), e))
        }

        fn with_serialization_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::serialization_error_with_source(f(), e))
        }

        fn with_deserialization_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::deserialization_error_with_source(f(), e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::context::ErrorContext;
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_creation() {
        let err = CommonError::storage_error("disk full");
        assert_eq!(err.to_string(), "Storage operation failed: disk full");
        assert_eq!(err.message(), "disk full");
        assert!(err.source().is_none());
    }

    #[test]
    fn test_error_chaining() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = CommonError::io_error_with_source("reading manifest", io);

        let source = err.source().expect("source should be kept");
        assert!(source.to_string().contains("no such file"));
        assert!(err.to_string().contains("reading manifest"));
    }

    #[test]
    fn test_error_context_extension() {
        let failing: std::result::Result<(), std::io::Error> = Err(std::io::Error::other("boom"));
        let err = failing
            .with_storage_context(|| "writing block 7".to_string())
            .unwrap_err();

        assert!(matches!(err, CommonError::StorageError { .. }));
        assert_eq!(err.message(), "writing block 7");
    }
}
