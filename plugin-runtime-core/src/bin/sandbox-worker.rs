//! Sandbox worker process
//!
//! Spawned by the host for `process` isolation. Frames arrive on stdin and
//! replies leave on stdout, so diagnostics go to stderr only.
//!
//! Usage:
//!   sandbox-worker
//!
//! Set `SANDBOX_WORKER_LOG=json` for JSON diagnostics.

use plugin_runtime_core::logging::{init_tracing, LogFormat};
use plugin_runtime_core::sandbox::process::LOG_FORMAT_ENV;
use plugin_runtime_core::sandbox::worker::serve;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let format = match std::env::var(LOG_FORMAT_ENV).as_deref() {
        Ok("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    };
    if let Err(e) = init_tracing(format) {
        eprintln!("sandbox-worker: {e}");
    }

    serve(tokio::io::stdin(), tokio::io::stdout()).await
}
