//! Session controller.
//!
//! Owns the single in-flight run, its cancellation token and the previous output, and emits
//! events for presentation layers.

use super::context::Toolchain;
use super::pipeline;
use crate::model::{RunReport, RunRequest};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Commands from the front end.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Start a run; an active run is cancelled first.
    Run(Box<RunRequest>),
    Cancel,
    Quit,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Status(String),
    Completed(Box<RunReport>),
}

/// Internal handle for a running orchestration task.
struct RunCtx {
    cancel: CancellationToken,
    handle: Option<tokio::task::JoinHandle<RunReport>>,
}

fn start_run(toolchain: &Arc<Toolchain>, request: RunRequest) -> RunCtx {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let toolchain = Arc::clone(toolchain);
    let handle = tokio::spawn(async move { pipeline::run(&toolchain, &request, token).await });
    RunCtx {
        cancel,
        handle: Some(handle),
    }
}

/// Serve commands until `Quit` (or until the command channel closes) and the active run,
/// if any, has wound down.
pub async fn run_session(
    toolchain: Arc<Toolchain>,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<SessionCommand>,
) {
    let mut run_ctx: Option<RunCtx> = None;
    let mut pending: Option<RunRequest> = None;
    let mut quit_pending = false;
    let mut previous_output: Option<String> = None;
    // Cancel watchdog: if a cancel takes too long, tell the user we are still on it.
    let mut cancel_deadline: Option<tokio::time::Instant> = None;
    let mut watchdog = tokio::time::interval(Duration::from_millis(500));

    let status = |message: &str| {
        let _ = event_tx.send(SessionEvent::Status(message.to_string()));
    };

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(SessionCommand::Run(request)) => {
                        // Runs are serialized: cancel the active one and start the new one once
                        // it has completed.
                        if let Some(ctx) = &run_ctx {
                            pending = Some(*request);
                            ctx.cancel.cancel();
                            status("Cancelling…");
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        } else {
                            run_ctx = Some(start_run(&toolchain, *request));
                        }
                    }
                    Some(SessionCommand::Cancel) => {
                        pending = None;
                        if let Some(ctx) = &run_ctx {
                            ctx.cancel.cancel();
                            status("Cancelling…");
                            cancel_deadline = Some(tokio::time::Instant::now() + Duration::from_secs(3));
                        }
                    }
                    Some(SessionCommand::Quit) | None => {
                        quit_pending = true;
                        pending = None;
                        match &run_ctx {
                            Some(ctx) => ctx.cancel.cancel(),
                            None => break,
                        }
                    }
                }
            }
            // Do not take the JoinHandle before this branch wins; otherwise it can be dropped
            // if another select branch is chosen, and we'll never observe completion.
            maybe_done = async {
                if let Some(ctx) = &mut run_ctx {
                    if let Some(h) = ctx.handle.as_mut() {
                        return Some(h.await);
                    }
                }
                futures::future::pending().await
            } => {
                if let Some(join_res) = maybe_done {
                    if let Some(ctx) = &mut run_ctx {
                        ctx.handle.take();
                    }
                    match join_res {
                        Ok(mut report) => {
                            report.previous_output = previous_output.clone();
                            if !report.output.trim().is_empty() {
                                previous_output = Some(report.output.clone());
                            }
                            let _ = event_tx.send(SessionEvent::Completed(Box::new(report)));
                        }
                        Err(e) => {
                            tracing::error!("run task failed: {e}");
                            status(&format!("Run join failed: {e}"));
                        }
                    }
                    run_ctx = None;
                    cancel_deadline = None;
                    if quit_pending {
                        break;
                    }
                    if let Some(request) = pending.take() {
                        run_ctx = Some(start_run(&toolchain, request));
                    }
                }
            }
            // If cancel stalls (e.g. a tool ignoring the kill), keep the user informed.
            _ = watchdog.tick() => {
                if let Some(deadline) = cancel_deadline {
                    if tokio::time::Instant::now() >= deadline && run_ctx.is_some() {
                        status("Still cancelling…");
                        cancel_deadline = None;
                    }
                }
            }
        }
    }
}
