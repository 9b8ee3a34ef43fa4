use std::fmt;

/// Receives the consequences of an unrecoverable authentication failure.
///
/// The pipeline calls [`logout`](SessionHandler::logout) and then
/// [`redirect`](SessionHandler::redirect) exactly once per failed refresh,
/// after the token store has been cleared.
pub trait SessionHandler: Send + Sync + fmt::Debug {
    fn logout(&self);

    fn redirect(&self, target: &str);
}

/// Default handler; records the session end in the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingSessionHandler;

impl SessionHandler for LoggingSessionHandler {
    fn logout(&self) {
        tracing::info!("Session ended");
    }

    fn redirect(&self, target: &str) {
        tracing::info!(location = target, "Redirect requested");
    }
}
