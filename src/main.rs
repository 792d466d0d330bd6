use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use recodarr::{App, Config};
use tracing::info;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn on_signal(_signal: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn install_signal_handlers() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, on_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, on_signal as libc::sighandler_t);
    }
}

fn main() -> anyhow::Result<()> {
    let config = Config::from_env();
    let _log_guards = recodarr::logging::init(&config.logs_dir, &config.log_level)?;
    info!(version = env!("CARGO_PKG_VERSION"), "recodarr starting");

    let app = App::bootstrap(config)?;
    app.start_daemons();

    install_signal_handlers();
    while !SHUTDOWN.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));
    }

    app.shutdown();
    Ok(())
}
