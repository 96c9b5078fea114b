use tokio_util::sync::CancellationToken;

/// Install a shutdown handler for termination requests from the OS.
///
/// Returns a `CancellationToken` that fires once a termination signal
/// arrives. All subsystems monitor this token and drain gracefully.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let fleet_token = token.clone();

    tokio::spawn(async move {
        let signal_name = wait_for_signal().await;
        tracing::info!(signal = signal_name, "shutdown requested, draining fleet");
        fleet_token.cancel();
    });

    token
}

/// Resolve with the name of the termination signal that arrived.
#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    );
    let (mut term, mut int) = match streams {
        (Ok(term), Ok(int)) => (term, int),
        (term, int) => {
            // Registration only fails when the runtime's signal driver is
            // unusable; degrade to plain ctrl-c rather than aborting.
            tracing::warn!(
                sigterm_ok = term.is_ok(),
                sigint_ok = int.is_ok(),
                "signal registration failed, falling back to ctrl-c"
            );
            let _ = tokio::signal::ctrl_c().await;
            return "ctrl-c";
        }
    };

    tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl-c"
}
