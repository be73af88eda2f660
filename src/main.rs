use std::io::BufRead;
use std::thread;

use chatline::orchestrator::Inbound;
use chatline::{ClusterError, Config, Orchestrator};

fn main() {
    env_logger::init();

    let config = match Config::from_args(std::env::args()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    let orchestrator = match Orchestrator::new(config) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("startup failed: {e}");
            std::process::exit(1);
        }
    };

    // EOF on stdin is our clean-shutdown signal. SIGINT/SIGTERM get no
    // custom handler: storage flushes on every write, so the OS's default
    // terminate-on-signal behavior already loses nothing.
    let shutdown_tx = orchestrator.shutdown_sender();
    thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut line = String::new();
        while stdin.lock().read_line(&mut line).unwrap_or(0) > 0 {
            line.clear();
        }
        let _ = shutdown_tx.send(Inbound::Shutdown);
    });

    match orchestrator.run() {
        Ok(()) => std::process::exit(0),
        Err(e @ ClusterError::StorageFatal { .. }) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
