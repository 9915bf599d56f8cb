use clap::Parser;
use std::io::{self, BufReader, BufWriter};
use std::time::Duration;
use warden_core::config::{default_max_call_depth, default_worker_idle_timeout_ms};
use warden_core::vm::ExecutionLimits;
use warden_core::worker::{ServerConfig, serve};

/// Exit code when the request or response stream breaks.
const WIRE_FAILURE_EXIT_CODE: i32 = 74;

/// Executes untrusted code units on behalf of a supervisor, speaking the
/// framed protocol on stdin/stdout. Logs go to stderr.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Exit after this many milliseconds without a command. 0 disables.
    #[clap(long, default_value_t = default_worker_idle_timeout_ms())]
    idle_timeout_ms: u64,
    #[clap(long, default_value_t = default_max_call_depth())]
    max_call_depth: usize,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let config = ServerConfig {
        limits: ExecutionLimits {
            max_call_depth: cli.max_call_depth.max(1),
            ..ExecutionLimits::default()
        },
        idle_timeout: match cli.idle_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        },
    };
    log::info!("worker {} starting with {config:?}", std::process::id());

    let code = match serve(BufReader::new(io::stdin()), BufWriter::new(io::stdout()), config) {
        Ok(outcome) => {
            log::info!("worker {} finished: {outcome:?}", std::process::id());
            outcome.exit_code()
        }
        Err(e) => {
            log::error!("worker {} protocol stream failed: {e}", std::process::id());
            WIRE_FAILURE_EXIT_CODE
        }
    };
    std::process::exit(code);
}
