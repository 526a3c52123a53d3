use crate::semihosting::Operation;
use crate::target::TargetError;
use crate::trace::TraceError;

/// Error type for the debug host services.
///
/// Host resource failures (a file that cannot be opened, a short write, ...) are not
/// reported through this type. They are handed to the target program through the
/// semihosting return value and errno channel instead.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// Error communicating with the target.
    Target(#[from] TargetError),

    /// Semihosting is not enabled for target {0}.
    NotEnabled(String),

    /// Target {0} has not been examined yet.
    NotExamined(String),

    /// The semihosting operation {0} is not supported in fileio mode.
    FileIoUnsupported(Operation),

    /// There is no staged fileio request to complete.
    NoPendingFileIo,

    /// Failed to start the semihosting redirect service on port {port}.
    Redirect {
        /// The TCP port the service should listen on.
        port: u16,
        /// The underlying socket error.
        source: std::io::Error,
    },

    /// A trace unit operation failed.
    Trace(#[from] TraceError),

    /// Some uncategorized error occurred.
    Other(#[from] anyhow::Error),
}
