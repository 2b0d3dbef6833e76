//! Fatal-error taxonomy for the daemon.
//!
//! A [`Error`] always means the event loop must stop and the process must
//! exit with a non-zero code. Expected, successful outcomes of a CDUS
//! request (an errno reply was sent to the kernel) are represented
//! separately by [`crate::cdus::Errno`] and never flow through this type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("usb error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("errno error: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("fatal: {0}")]
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shorthand for building a [`Error::Fatal`] from a `format!`-style message.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::Error::Fatal(format!($($arg)*))
    };
}
