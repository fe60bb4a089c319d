// Loop lifecycle helpers shared by the four monitor loops

use crate::application::shutdown::ShutdownToken;
use crate::error::{AppError, Result};
use crate::port::{QueueDatabase, QueueSession};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Serializes scheduler consumption plus admission across the standard
/// and priority loops
pub type AdmissionLock = Arc<Mutex<()>>;

pub fn admission_lock() -> AdmissionLock {
    Arc::new(Mutex::new(()))
}

/// Session for a loop's whole lifetime; failure to get one is fatal
pub async fn open_session(
    db: &dyn QueueDatabase,
    identity: &str,
    token: &ShutdownToken,
) -> Result<Box<dyn QueueSession>> {
    match db.session(identity).await {
        Ok(session) => Ok(session),
        Err(e) => {
            token.abort(format!("{}: cannot obtain a database connection: {}", identity, e));
            Err(match e {
                AppError::Connection(_) => e,
                other => AppError::Connection(other.to_string()),
            })
        }
    }
}

/// Translate the error that ended a loop into its completion status
///
/// Cancellation is a clean exit. Fatal errors raise the quit flag so every
/// other loop stops too.
pub fn finish_loop(identity: &str, reason: AppError, token: &ShutdownToken) -> Result<()> {
    match reason {
        AppError::Cancelled => {
            info!(identity = identity, "Loop detected quit, done");
            Ok(())
        }
        e if e.is_fatal() => {
            token.abort(format!("{}: {}", identity, e));
            Err(e)
        }
        e => {
            error!(identity = identity, error = %e, "Loop stopped unexpectedly");
            token.abort(format!("{}: {}", identity, e));
            Err(e)
        }
    }
}

/// Whether an error must end the enclosing loop instead of the current item
pub fn ends_loop(e: &AppError) -> bool {
    e.is_cancelled() || e.is_fatal()
}
