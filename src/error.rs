//! Error types for oql.
//!
//! Failures fall into four families: problems with the query text
//! ([`QueryError`]), with the mapping model ([`MappingError`]), with the
//! values bound at execution ([`BindingError`]) and with the backend
//! ([`ExecutionError`]). [`OqlError`] wraps all of them.

use thiserror::Error;

/// The main error type for oql operations.
#[derive(Debug, Error)]
pub enum OqlError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Binding(#[from] BindingError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Malformed query text, or a query used in a way its plan does not allow.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    /// Failed to parse the query string.
    #[error("Parse error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    /// A `{name}` placeholder had no substitution.
    #[error("Unknown substitution placeholder '{{{name}}}' in query [{query}]")]
    UnknownPlaceholder { name: String, query: String },

    /// Positional `?` parameters without an ordinal.
    #[error(
        "Legacy-style query parameters (`?`) are no longer supported; use JPA-style ordinal parameters (e.g., `?1`) instead : {query}"
    )]
    LegacyOrdinalParameter { query: String },

    /// The type of an expression could not be inferred from its context.
    #[error("Could not determine type of: {fragment}")]
    UndeterminedType { fragment: String },

    /// Semantically invalid query fragment.
    #[error("{message} [{query}]")]
    Invalid { message: String, query: String },

    /// Collection fetch combined with a cursor based execution mode.
    #[error("fetch may not be used with scroll() or iterate()")]
    FetchWithScroll,

    /// An execution mode that does not fit the plan kind.
    #[error("{operation}() is not supported for {kind} statements: {query}")]
    WrongMode {
        operation: &'static str,
        kind: &'static str,
        query: String,
    },

    /// The translator was used before `compile`.
    #[error("Query has not been compiled: {query}")]
    NotCompiled { query: String },
}

impl QueryError {
    /// Create a syntax error at the given position.
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    /// Create a semantic error about the given query.
    pub fn invalid(message: impl Into<String>, query: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
            query: query.into(),
        }
    }
}

/// A reference the mapping model cannot resolve.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MappingError {
    #[error("Unknown entity: '{entity}'")]
    UnknownEntity { entity: String },

    #[error("Could not resolve property '{property}' of entity '{entity}'")]
    UnknownProperty { entity: String, property: String },

    #[error("Property '{property}' of entity '{entity}' is not an association")]
    NotAnAssociation { entity: String, property: String },

    #[error("Invalid mapping for '{entity}': {message}")]
    Invalid { entity: String, message: String },
}

impl MappingError {
    pub fn unknown_property(entity: impl Into<String>, property: impl Into<String>) -> Self {
        Self::UnknownProperty {
            entity: entity.into(),
            property: property.into(),
        }
    }

    pub fn invalid(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            entity: entity.into(),
            message: message.into(),
        }
    }
}

/// Mismatch between the parameters a plan declares and the values supplied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BindingError {
    #[error("Named parameter does not appear in Query: {name}")]
    UnknownNamed { name: String },

    #[error("Ordinal parameter [?{position}] does not appear in Query [{query}]")]
    UnknownOrdinal { position: u32, query: String },

    #[error("No value bound for named parameter [:{name}] in Query [{query}]")]
    MissingNamed { name: String, query: String },

    #[error(
        "Ordinal parameter [?{position}] does not appear in the supplied parameters for Query [{query}]"
    )]
    MissingOrdinal { position: u32, query: String },

    #[error("Parameter [{parameter}] is bound to a list but is not used in an in-list position")]
    UnexpectedList { parameter: String },

    #[error("Parameter list for [{parameter}] must not be empty")]
    EmptyList { parameter: String },

    #[error("Parameter [{parameter}] expects a value of type {expected}, got {actual}")]
    TypeMismatch {
        parameter: String,
        expected: String,
        actual: String,
    },

    #[error("Filter parameter [{filter}.{parameter}] has no value")]
    MissingFilterParameter { filter: String, parameter: String },
}

/// Backend failure during an execution call.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Execution error in [{sql}]: {source}")]
    Statement {
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Could not read column '{column}': {source}")]
    Hydration {
        column: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Could not convert column '{column}': {message}")]
    Conversion { column: String, message: String },
}

impl ExecutionError {
    pub fn statement(sql: impl Into<String>, source: sqlx::Error) -> Self {
        Self::Statement {
            sql: sql.into(),
            source,
        }
    }
}

/// Result type alias for oql operations.
pub type OqlResult<T> = Result<T, OqlError>;
