//! Worker side of `process` isolation
//!
//! [`serve`] is the whole body of the `sandbox-worker` binary: announce
//! readiness, then execute guest requests one at a time until the host
//! sends `Shutdown` or closes the pipe.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::sandbox::ipc::{read_frame, write_frame, ExecuteReply, Frame, FrameKind, LogRecord};
use crate::sandbox::wasm::{GuestRequest, WasmEngine};

/// Serve execution requests over a framed stream.
///
/// # Errors
///
/// Fails when the engine cannot be built or the stream breaks.
pub async fn serve<R, W>(mut input: R, mut output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let engine = WasmEngine::new()?;
    write_frame(&mut output, &Frame::empty(FrameKind::Ready)).await?;
    info!(pid = std::process::id(), "sandbox worker ready");

    while let Some(frame) = read_frame(&mut input).await? {
        match frame.kind {
            FrameKind::Execute => {
                let reply: ExecuteReply = match frame.parse_json::<GuestRequest>() {
                    Ok(request) => engine.run(request).await,
                    Err(e) => Err(crate::error::ExecutionFailure::Worker(format!(
                        "malformed execute request: {e}"
                    ))),
                };

                if let Ok(outcome) = &reply {
                    for log in &outcome.logs {
                        let record = LogRecord {
                            level: log.level,
                            message: log.message.clone(),
                        };
                        write_frame(&mut output, &Frame::json(FrameKind::Log, &record)?).await?;
                    }
                }
                debug!(ok = reply.is_ok(), "execution finished");
                write_frame(&mut output, &Frame::json(FrameKind::Result, &reply)?).await?;
            }
            FrameKind::Shutdown => {
                info!("shutdown requested");
                break;
            }
            other => warn!(?other, "ignoring unexpected frame from host"),
        }
    }

    Ok(())
}
