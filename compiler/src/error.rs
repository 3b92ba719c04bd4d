// error.rs - Crate-wide error type
//
// Two tiers. `User` wraps a diagnostic describing a contract the caller broke
// (bad dimension name, unprovable reduction, undeclared parameter); lowering
// aborts with no partial output. `Internal` is an invariant the compiler
// itself broke.

use snafu::Snafu;

use crate::diag::Diagnostic;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("{diagnostic}"))]
    User { diagnostic: Diagnostic },

    #[snafu(display("internal compiler error: {message}"))]
    Internal { message: String },
}

impl Error {
    pub fn user(diagnostic: Diagnostic) -> Self {
        Error::User { diagnostic }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// The diagnostic of a user error.
    pub fn diagnostic(&self) -> Option<&Diagnostic> {
        match self {
            Error::User { diagnostic } => Some(diagnostic),
            Error::Internal { .. } => None,
        }
    }

    /// Stable code of a user error, handy in tests.
    pub fn code(&self) -> Option<&'static str> {
        self.diagnostic().and_then(|d| d.code).map(|c| c.0)
    }
}

impl From<Diagnostic> for Error {
    fn from(diagnostic: Diagnostic) -> Self {
        Error::User { diagnostic }
    }
}

#[cfg(test)]
mod tests {
    use snafu::ensure;

    use super::*;
    use crate::diag::codes;

    fn check(factor: i64) -> Result<()> {
        ensure!(
            factor > 0,
            UserSnafu {
                diagnostic: Diagnostic::error(codes::E0103_BAD_FACTOR, "split factor must be positive"),
            }
        );
        Ok(())
    }

    #[test]
    fn ensure_produces_user_error() {
        assert!(check(4).is_ok());
        let err = check(0).unwrap_err();
        assert_eq!(err.code(), Some("E0103"));
        assert_eq!(err.to_string(), "error[E0103]: split factor must be positive");
    }

    #[test]
    fn internal_errors_have_no_code() {
        let err = InternalSnafu { message: "bad" }.build();
        assert_eq!(err.code(), None);
        assert_eq!(err.to_string(), "internal compiler error: bad");
    }
}
