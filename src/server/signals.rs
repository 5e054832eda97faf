// Signal handling for graceful server shutdown

use crate::error::{Result, SmartChatError};
use tokio::signal::unix::{signal, Signal as TokioSignal, SignalKind};

/// Waits on the Unix signals that stop the server
pub struct SignalHandler {
    sigterm: TokioSignal,
    sigint: TokioSignal,
    sighup: TokioSignal,
}

impl SignalHandler {
    /// Sets up handlers for SIGTERM, SIGINT and SIGHUP
    pub fn new() -> Result<Self> {
        let install = |kind: SignalKind, name: &str| {
            signal(kind).map_err(|e| SmartChatError::Io {
                source: e,
                context: format!("Failed to setup {} handler", name),
            })
        };

        Ok(Self {
            sigterm: install(SignalKind::terminate(), "SIGTERM")?,
            sigint: install(SignalKind::interrupt(), "SIGINT")?,
            sighup: install(SignalKind::hangup(), "SIGHUP")?,
        })
    }

    /// Wait for any handled signal, returning its name
    pub async fn wait(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigterm.recv() => {
                tracing::info!("Received SIGTERM");
                "terminate"
            }
            _ = self.sigint.recv() => {
                tracing::info!("Received SIGINT");
                "interrupt"
            }
            _ = self.sighup.recv() => {
                tracing::info!("Received SIGHUP");
                "hangup"
            }
        }
    }
}
