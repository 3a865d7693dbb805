// Process lifecycle: shutdown signals, panic reporting and exit status.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

/// Why the process is stopping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// Unexpected error or panic anywhere in the process.
    Fatal(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Interrupt | ShutdownReason::Terminate => 0,
            ShutdownReason::Fatal(_) => 1,
        }
    }
}

/// Shared shutdown signal. The first reason recorded wins.
#[derive(Debug, Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown is triggered.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Trigger shutdown. Later reasons are ignored.
    pub fn shutdown(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    /// Install system signal handlers (Ctrl+C, SIGTERM).
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM, shutting down");
                        manager.shutdown(ShutdownReason::Terminate);
                    }
                    Err(e) => tracing::warn!("Failed to install SIGTERM handler: {}", e),
                }
            });
        }
    }

    /// Log panics from any thread and turn them into a fatal shutdown.
    pub fn install_panic_hook(&self) {
        let manager = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let message = panic_message(info.payload());
            let location = info
                .location()
                .map(|l| format!("{}:{}", l.file(), l.line()))
                .unwrap_or_default();
            tracing::error!("Panic at {}: {}", location, message);
            manager.shutdown(ShutdownReason::Fatal(message));
            previous(info);
        }));
    }
}

/// Extract the text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
