use tokio_util::sync::CancellationToken;

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                result = tokio::signal::ctrl_c() => result,
                _ = sigterm.recv() => Ok(()),
            }
        }
        // SIGTERM registration failed, fall back to SIGINT only
        Err(_) => tokio::signal::ctrl_c().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

/// First signal cancels the download; in-flight segments stop and the
/// coordinator unwinds normally. A second signal exits immediately.
pub async fn cancel_on_signal(cancel: CancellationToken) {
    if wait_for_signal().await.is_err() {
        return;
    }

    eprintln!("\n  ⚠ Cancelling download... (press Ctrl+C again to force quit)");
    cancel.cancel();

    if wait_for_signal().await.is_ok() {
        eprintln!("\n  ✖ Force quit.");
        std::process::exit(1);
    }
}

pub fn spawn_signal_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(cancel_on_signal(cancel))
}
