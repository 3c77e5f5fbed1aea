//! taskplane control-plane entry point.
//!
//! Initialises logging and delegates to the CLI module for command
//! handling. Exit codes: 0 normal shutdown, 1 configuration error,
//! 2 store unreachable after retries.

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first to get log_level.
    let cli = taskplane::cli::parse_cli();

    // Priority: RUST_LOG env var > --log-level CLI arg > LOG_LEVEL env.
    let log_level = std::env::var("RUST_LOG")
        .ok()
        .or_else(|| std::env::var("LOG_LEVEL").ok())
        .unwrap_or_else(|| cli.log_level.clone());
    let log_format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_default();
    taskplane::config::init_tracing(&log_level, log_format);

    match taskplane::cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}
