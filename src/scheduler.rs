//! Readiness and timer notifications for connect jobs.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::future::Future;
use core::pin::Pin;
use std::boxed::Box;
use std::time::Duration;
use tokio::time::Instant;

//------------ Watch ----------------------------------------------------------

/// A pending scheduler registration.
///
/// Dropping the watch cancels it; a cancelled watch never resolves, so no
/// stale handler can fire against torn-down state.
pub type Watch = Pin<Box<dyn Future<Output = ()> + Send>>;

//------------ EventScheduler -------------------------------------------------

/// Delivers asynchronous events to a connect job.
///
/// All watches handed out for one job resolve on the same task, so handler
/// execution is serialized and the job needs no locking. Each watch resolves
/// at most once.
pub trait EventScheduler<S> {
    /// Returns a watch that resolves when `socket` becomes writable.
    fn writable(&self, socket: &S) -> Watch;

    /// Returns a watch that resolves if `socket` is closed by code outside
    /// the job while the job still holds it.
    fn closed(&self, socket: &S) -> Watch;

    /// Returns a watch that resolves after `duration` has passed.
    fn sleep(&self, duration: Duration) -> Watch;

    /// Returns the current time.
    fn now(&self) -> Instant;
}

//------------ TokioScheduler -------------------------------------------------

#[cfg(unix)]
mod tokio_impl {
    use super::{EventScheduler, Watch};
    use std::future::pending;
    use std::os::fd::{AsRawFd, RawFd};
    use std::time::Duration;
    use tokio::io::unix::AsyncFd;
    use tokio::io::Interest;
    use tokio::time::Instant;
    use tracing::warn;

    /// An fd registered for readiness only; dropping it must not close the
    /// fd, which stays owned by the job.
    #[derive(Debug)]
    struct RawSocket(RawFd);

    impl AsRawFd for RawSocket {
        fn as_raw_fd(&self) -> RawFd {
            self.0
        }
    }

    /// The event scheduler backed by the Tokio runtime.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct TokioScheduler;

    impl<S: AsRawFd> EventScheduler<S> for TokioScheduler {
        fn writable(&self, socket: &S) -> Watch {
            let fd = socket.as_raw_fd();
            Box::pin(async move {
                let afd = match AsyncFd::with_interest(
                    RawSocket(fd),
                    Interest::WRITABLE,
                ) {
                    Ok(afd) => afd,
                    Err(err) => {
                        warn!(fd, "cannot watch socket for writability: {}", err);
                        // Leave the watch pending; the job's deadline still
                        // terminates it.
                        return pending().await;
                    }
                };
                if let Err(err) = afd.writable().await {
                    warn!(fd, "writability watch failed: {}", err);
                    pending::<()>().await;
                }
            })
        }

        fn closed(&self, _socket: &S) -> Watch {
            // The job owns its fd exclusively under this scheduler, so
            // nothing outside it can close the fd. The subscription still
            // exists so that schedulers which do share fds can honor it.
            Box::pin(pending())
        }

        fn sleep(&self, duration: Duration) -> Watch {
            Box::pin(tokio::time::sleep(duration))
        }

        fn now(&self) -> Instant {
            Instant::now()
        }
    }
}

#[cfg(unix)]
pub use self::tokio_impl::TokioScheduler;
