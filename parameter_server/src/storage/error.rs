use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for size mismatch checks inside the storage module.
pub type Result<T> = std::result::Result<T, SizeMismatchErr>;

/// Error returned whenever a gradient, a parameter buffer or an external buffer doesn't have the
/// size of the storage it's meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeMismatchErr;

impl Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the provided buffer length doesn't match the parameter storage size")
    }
}

impl Error for SizeMismatchErr {}
