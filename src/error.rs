use std::fmt;

use failure::{Backtrace, Context, Fail};

#[derive(Debug)]
pub(crate) struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, PartialEq, Eq, Fail)]
pub(crate) enum ErrorKind {
    #[fail(display = "syntax error: {}", _0)]
    Syntax(String),

    #[fail(display = "unknown variable name '{}'", _0)]
    UnknownVariable(String),

    #[fail(display = "unknown function referenced '{}'", _0)]
    UnknownFunction(String),

    #[fail(
        display = "incorrect number of arguments passed to '{}': expected {}, found {}",
        callee, expected, found
    )]
    ArgumentCount {
        callee: String,
        expected: usize,
        found: usize,
    },

    #[fail(display = "unknown binary operator '{}'", _0)]
    UnknownOperator(char),

    #[fail(display = "cannot redefine function '{}'", _0)]
    Redefinition(String),

    #[fail(
        display = "function '{}' declared with {} parameters, found {}",
        name, expected, found
    )]
    SignatureMismatch {
        name: String,
        expected: usize,
        found: usize,
    },

    #[fail(display = "invalid function '{}': {}", function, reason)]
    Verification { function: String, reason: String },

    #[fail(display = "execution failed: {}", _0)]
    Execution(String),

    #[fail(display = "cannot read input '{}'", _0)]
    Io(String),
}

impl Error {
    pub(crate) fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

pub(crate) fn syntax_error<T>(message: impl Into<String>) -> Result<T, Error> {
    Err(Error::from(ErrorKind::Syntax(message.into())))
}
