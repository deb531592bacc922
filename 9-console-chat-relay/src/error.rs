use std::io;

use thiserror::Error;

/// Why a connection never made it past identity negotiation.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection closed before an identity was sent")]
    ClosedBeforeIdentity,
    #[error("identity cannot be empty")]
    EmptyIdentity,
    #[error("shutdown requested during negotiation")]
    Shutdown,
    #[error(transparent)]
    Io(#[from] io::Error),
}
