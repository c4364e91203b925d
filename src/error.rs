//! Error type for the connect engine.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::error;
use std::fmt::{Display, Formatter};
use std::io;
use std::sync::Arc;

//------------ Error ----------------------------------------------------------

/// Why a connect job failed.
///
/// Delivered inside a failed outcome. Transient connect errors are retried
/// within the job's budget and never surface individually; only the final
/// exhaustion does. Timeouts and aborts are separate outcomes, not errors.
#[derive(Clone, Debug)]
pub enum Error {
    /// Creating the socket gave an error.
    SocketOpen(Arc<io::Error>),

    /// Every connect attempt failed and the retry budget is spent.
    ///
    /// Carries the raw OS error of the last attempt.
    Exhausted(i32),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Error::SocketOpen(_) => write!(f, "error creating socket"),
            Error::Exhausted(errno) => write!(
                f,
                "connect failed: {}",
                io::Error::from_raw_os_error(*errno)
            ),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::SocketOpen(err) => Some(err),
            Error::Exhausted(_) => None,
        }
    }
}
