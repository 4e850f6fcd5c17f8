//! Utility macros shared by the crate.

/// Early-returns `Err($error)` when `$predicate` does not hold.
///
/// Works like `assert!`, but for recoverable validation failures.
///
/// ```ignore
/// ensure!(size > 0, FetchError::type_error("chunk size must be positive"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
