//! Macros for replication-link error handling.

/// Creates a [`crate::error::LinkError`] from error kind and description,
/// with optional dynamic detail.
#[macro_export]
macro_rules! link_error {
    ($kind:expr, $desc:expr) => {
        LinkError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        LinkError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns a [`crate::error::LinkError`] from the current function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::link_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::link_error!($kind, $desc, $detail))
    };
}
