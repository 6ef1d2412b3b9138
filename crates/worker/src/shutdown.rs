use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::signal::unix::{SignalKind, signal};

/// Handle termination signals for the worker process.
///
/// Until the supervisor is armed (clients connected, worker constructed), a
/// signal exits immediately: we are likely PID 1 and there is nothing worth
/// finishing yet. Once armed, the first signal requests a cooperative stop
/// via `should_exit` and a second one forces an immediate exit.
pub fn spawn_signal_handler(should_exit: Arc<AtomicBool>, armed: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                eprintln!("failed to install SIGTERM handler: {err}");
                return;
            }
        };

        let mut requested = false;
        loop {
            tokio::select! {
                _ = sigterm.recv() => {}
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() {
                        return;
                    }
                }
            }

            if !armed.load(Ordering::SeqCst) {
                eprintln!("caught early termination signal, exiting immediately");
                std::process::exit(1);
            }

            if !requested {
                requested = true;
                tracing::info!("stop requested, finishing current work before exiting");
                should_exit.store(true, Ordering::SeqCst);
            } else {
                tracing::warn!("stop requested again, exiting immediately");
                std::process::exit(1);
            }
        }
    });
}
