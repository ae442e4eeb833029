//! Bootloader stub. A bundle is this executable with an archive appended
//! (or stored next to it as `<exe>.thaw`).

use thaw_runtime::{Launcher, NativeEntryRuntime};

fn main() {
    thaw_cli::logging::init();

    let outcome = Launcher::from_env(NativeEntryRuntime).and_then(|launcher| launcher.run());
    match outcome {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            tracing::debug!(kind = ?e.kind(), "bootstrap failed");
            eprintln!("thaw: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
