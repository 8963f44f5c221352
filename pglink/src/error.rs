use std::error;
use std::fmt;

/// Convenient result type for topology operations using [`LinkError`] as the error type.
pub type LinkResult<T> = Result<T, LinkError>;

/// Main error type for replication-link operations.
///
/// [`LinkError`] carries an [`ErrorKind`] for classification, a static
/// description, optional dynamic detail, and can aggregate several errors
/// (best-effort teardown reports every failure, not just the first).
#[derive(Debug, Clone)]
pub struct LinkError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, String),
    Many(Vec<LinkError>),
}

/// Categories of errors that can occur while managing a replication link.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The instance is unreachable, the descriptor is bad, or the connect timed out.
    ConnectionFailed,
    /// The instance rejected the supplied credentials.
    AuthenticationError,
    /// The connected role lacks the elevated privileges this tool requires.
    InsufficientPrivilege,
    /// The server is older than the minimum supported version.
    UnsupportedServerVersion,
    /// A statement failed for reasons other than the ones classified below.
    QueryFailed,
    /// A catalog value could not be converted into its typed form.
    ConversionError,
    /// An operation was invoked with invalid inputs.
    ValidationError,
    /// The advisory lock is held elsewhere; the operation aborted cleanly and
    /// may be retried later.
    LockContention,
    /// The topology no longer matches what the catalog row references, which
    /// signals it was mutated outside this tool.
    StateInconsistency,
    /// The connection's transaction state does not allow the statement.
    InvalidState,
    /// The server canceled the statement or is shutting down.
    OperationCanceled,
    /// Configuration could not be loaded or persisted.
    ConfigError,
    /// An I/O failure outside the database protocol.
    IoError,
    /// Unclassified failure.
    Unknown,
}

impl LinkError {
    /// Creates a [`LinkError`] aggregating multiple errors.
    pub fn many(errors: Vec<LinkError>) -> LinkError {
        LinkError {
            repr: ErrorRepr::Many(errors),
        }
    }

    /// Returns the [`ErrorKind`] of this error.
    ///
    /// For aggregated errors, returns the kind of the first error, or
    /// [`ErrorKind::Unknown`] when the aggregate is empty.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::WithDescription(kind, _) => *kind,
            ErrorRepr::WithDescriptionAndDetail(kind, _, _) => *kind,
            ErrorRepr::Many(errors) => errors
                .first()
                .map(|e| e.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] present in this error.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match &self.repr {
            ErrorRepr::WithDescription(kind, _) => vec![*kind],
            ErrorRepr::WithDescriptionAndDetail(kind, _, _) => vec![*kind],
            ErrorRepr::Many(errors) => errors.iter().flat_map(|e| e.kinds()).collect(),
        }
    }

    /// Returns the dynamic detail, when present.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, detail) => Some(detail),
            _ => None,
        }
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::WithDescription(_, description) => write!(f, "{description}"),
            ErrorRepr::WithDescriptionAndDetail(_, description, detail) => {
                write!(f, "{description}: {detail}")
            }
            ErrorRepr::Many(errors) => {
                let rendered: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                write!(f, "{}", rendered.join("; "))
            }
        }
    }
}

impl error::Error for LinkError {}

impl From<(ErrorKind, &'static str)> for LinkError {
    fn from((kind, description): (ErrorKind, &'static str)) -> LinkError {
        LinkError {
            repr: ErrorRepr::WithDescription(kind, description),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for LinkError {
    fn from((kind, description, detail): (ErrorKind, &'static str, String)) -> LinkError {
        LinkError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, description, detail),
        }
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> LinkError {
        LinkError::from((ErrorKind::IoError, "I/O operation failed", err.to_string()))
    }
}

/// Converts [`tokio_postgres::Error`] to [`LinkError`], classifying by
/// SQLSTATE when the server reported one.
impl From<tokio_postgres::Error> for LinkError {
    fn from(err: tokio_postgres::Error) -> LinkError {
        use tokio_postgres::error::SqlState;

        let (kind, description) = match err.code() {
            Some(sqlstate) => match *sqlstate {
                // Connection errors (08xxx)
                SqlState::CONNECTION_EXCEPTION
                | SqlState::CONNECTION_DOES_NOT_EXIST
                | SqlState::CONNECTION_FAILURE
                | SqlState::SQLCLIENT_UNABLE_TO_ESTABLISH_SQLCONNECTION
                | SqlState::SQLSERVER_REJECTED_ESTABLISHMENT_OF_SQLCONNECTION => {
                    (ErrorKind::ConnectionFailed, "PostgreSQL connection error")
                }

                // Authentication errors (28xxx)
                SqlState::INVALID_AUTHORIZATION_SPECIFICATION | SqlState::INVALID_PASSWORD => (
                    ErrorKind::AuthenticationError,
                    "PostgreSQL authentication failed",
                ),

                SqlState::INSUFFICIENT_PRIVILEGE => (
                    ErrorKind::InsufficientPrivilege,
                    "PostgreSQL permission denied",
                ),

                // Referenced objects appearing or disappearing underneath us
                // means the topology was mutated outside this tool.
                SqlState::UNDEFINED_OBJECT
                | SqlState::UNDEFINED_TABLE
                | SqlState::UNDEFINED_FUNCTION
                | SqlState::DUPLICATE_OBJECT
                | SqlState::OBJECT_IN_USE => (
                    ErrorKind::StateInconsistency,
                    "PostgreSQL object state changed underneath this tool",
                ),

                // Data conversion errors (22xxx)
                SqlState::DATA_EXCEPTION
                | SqlState::INVALID_TEXT_REPRESENTATION
                | SqlState::NUMERIC_VALUE_OUT_OF_RANGE => {
                    (ErrorKind::ConversionError, "PostgreSQL data conversion error")
                }

                // Constraint violations (23xxx)
                SqlState::INTEGRITY_CONSTRAINT_VIOLATION | SqlState::UNIQUE_VIOLATION => {
                    (ErrorKind::ValidationError, "PostgreSQL constraint violation")
                }

                // Transaction state errors (25xxx, 40xxx)
                SqlState::ACTIVE_SQL_TRANSACTION
                | SqlState::NO_ACTIVE_SQL_TRANSACTION
                | SqlState::INVALID_TRANSACTION_STATE
                | SqlState::TRANSACTION_ROLLBACK
                | SqlState::T_R_SERIALIZATION_FAILURE
                | SqlState::T_R_DEADLOCK_DETECTED => {
                    (ErrorKind::InvalidState, "PostgreSQL transaction error")
                }

                // Resource errors (53xxx)
                SqlState::INSUFFICIENT_RESOURCES
                | SqlState::OUT_OF_MEMORY
                | SqlState::TOO_MANY_CONNECTIONS => {
                    (ErrorKind::ConnectionFailed, "PostgreSQL resource limitation")
                }

                // Operator intervention (57xxx)
                SqlState::OPERATOR_INTERVENTION
                | SqlState::QUERY_CANCELED
                | SqlState::ADMIN_SHUTDOWN
                | SqlState::CRASH_SHUTDOWN
                | SqlState::CANNOT_CONNECT_NOW => {
                    (ErrorKind::OperationCanceled, "PostgreSQL operation canceled")
                }

                SqlState::SYNTAX_ERROR | SqlState::SYNTAX_ERROR_OR_ACCESS_RULE_VIOLATION => {
                    (ErrorKind::QueryFailed, "PostgreSQL syntax or access error")
                }

                _ => (ErrorKind::QueryFailed, "PostgreSQL operation failed"),
            },
            // No SQLSTATE means the failure happened below the protocol,
            // typically a dropped or unreachable connection.
            None => (ErrorKind::ConnectionFailed, "PostgreSQL connection lost"),
        };

        LinkError::from((kind, description, err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_of_aggregate_is_first_kind() {
        let err = LinkError::many(vec![
            LinkError::from((ErrorKind::LockContention, "lock busy")),
            LinkError::from((ErrorKind::IoError, "disk gone")),
        ]);

        assert_eq!(err.kind(), ErrorKind::LockContention);
        assert_eq!(
            err.kinds(),
            vec![ErrorKind::LockContention, ErrorKind::IoError]
        );
    }

    #[test]
    fn empty_aggregate_is_unknown() {
        assert_eq!(LinkError::many(Vec::new()).kind(), ErrorKind::Unknown);
    }

    #[test]
    fn display_includes_detail() {
        let err = LinkError::from((
            ErrorKind::ValidationError,
            "rewind target must not be null",
            "origin 'sub1'".to_string(),
        ));

        assert_eq!(err.to_string(), "rewind target must not be null: origin 'sub1'");
        assert_eq!(err.detail(), Some("origin 'sub1'"));
    }
}
