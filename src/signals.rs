use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio_util::sync::CancellationToken;

/// What should we do when the user stops this program?
///
/// The first SIGINT or SIGTERM cancels `cancel` so every loop winds down;
/// a second one exits right away.
pub fn handle_shutdown(cancel: CancellationToken) {
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("No signals :(. This really should never happen");

    std::thread::spawn(move || {
        for signal in signals.forever() {
            if cancel.is_cancelled() {
                log::warn!("Received signal {signal} during shutdown, exiting now");
                std::process::exit(1);
            }
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            cancel.cancel();
        }
    });
}
