// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The single thread that owns the control channel.
//!
//! Requests arrive on a one-slot intake channel and replies leave on a
//! one-slot reply channel, tagged with the id of the request they answer.
//! Any transport failure ends the loop; the thread then answers the
//! in-flight request with a synthetic failure and reaps the helper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{self as chan, Receiver, SendTimeoutError, Sender};
use privfs_proto::{read_response, ControlChannel, FrameError, OutboundRequest, Response};
use tracing::{debug, error, info, trace, warn};

use crate::supervisor::{self, enter, HelperSession, SupervisorState};

pub(crate) enum Intake {
    Request { id: u64, request: OutboundRequest },
    Stop,
}

pub(crate) struct Reply {
    pub id: u64,
    /// `Err` carries the text of a protocol or transport failure.
    pub result: Result<Response, String>,
}

pub(crate) struct DispatchHandle {
    pub intake: Sender<Intake>,
    pub replies: Receiver<Reply>,
    /// Disconnects when the dispatch thread has finished its teardown.
    pub done: Receiver<()>,
    pub thread: JoinHandle<()>,
    /// Set by the dispatch thread once the channel is unusable.
    pub broken: Arc<AtomicBool>,
}

struct Dispatcher {
    session: HelperSession,
    intake: Receiver<Intake>,
    replies: Sender<Reply>,
    publish_timeout: Duration,
    drain_timeout: Duration,
    debug: bool,
    broken: Arc<AtomicBool>,
    _done: Sender<()>,
}

pub(crate) fn spawn(
    session: HelperSession,
    publish_timeout: Duration,
    drain_timeout: Duration,
    debug: bool,
) -> std::io::Result<DispatchHandle> {
    let (intake_tx, intake_rx) = chan::bounded(1);
    let (reply_tx, reply_rx) = chan::bounded(1);
    let (done_tx, done_rx) = chan::bounded::<()>(0);
    let broken = Arc::new(AtomicBool::new(false));

    let dispatcher = Dispatcher {
        session,
        intake: intake_rx,
        replies: reply_tx,
        publish_timeout,
        drain_timeout,
        debug,
        broken: broken.clone(),
        _done: done_tx,
    };
    let thread = thread::Builder::new()
        .name("privfs-dispatch".into())
        .spawn(move || dispatcher.run())?;

    Ok(DispatchHandle {
        intake: intake_tx,
        replies: reply_rx,
        done: done_rx,
        thread,
        broken,
    })
}

impl Dispatcher {
    fn run(mut self) {
        enter(SupervisorState::Ready);
        loop {
            let (id, request) = match self.intake.recv() {
                Ok(Intake::Request { id, request }) => (id, request),
                Ok(Intake::Stop) => {
                    self.drain();
                    break;
                }
                Err(_) => {
                    debug!(operation = "dispatch_loop", "proxy dropped, leaving dispatch loop");
                    break;
                }
            };

            enter(SupervisorState::Serving);
            let tag = request.tag;
            let result = self.serve(&request);
            // The request's descriptors close here, after transmission.
            drop(request);

            let reply = match result {
                Ok(response) => {
                    if self.debug {
                        trace!(
                            operation = "dispatch_reply",
                            request_id = id,
                            tag = %tag,
                            message = ?response.message,
                            has_fd = response.fd.is_some(),
                            "reply received"
                        );
                    }
                    Reply {
                        id,
                        result: Ok(response),
                    }
                }
                Err(FrameError::Io(err)) => {
                    error!(
                        operation = "dispatch_io",
                        request_id = id,
                        tag = %tag,
                        error = %err,
                        "control channel failed"
                    );
                    self.broken.store(true, Ordering::Release);
                    let _ = self.replies.try_send(Reply {
                        id,
                        result: Err(format!("Disconnected: {err}")),
                    });
                    break;
                }
                Err(err) => {
                    warn!(
                        operation = "dispatch_decode",
                        request_id = id,
                        tag = %tag,
                        error = %err,
                        "undecodable reply"
                    );
                    Reply {
                        id,
                        result: Err(err.to_string()),
                    }
                }
            };

            match self.replies.send_timeout(reply, self.publish_timeout) {
                Ok(()) => enter(SupervisorState::Ready),
                Err(SendTimeoutError::Timeout(abandoned)) => {
                    warn!(
                        operation = "dispatch_publish",
                        request_id = abandoned.id,
                        "caller stopped waiting, reply dropped"
                    );
                }
                Err(SendTimeoutError::Disconnected(_)) => break,
            }
        }
        self.shutdown();
    }

    fn serve(&mut self, request: &OutboundRequest) -> Result<Response, FrameError> {
        if self.debug {
            trace!(
                operation = "dispatch_send",
                tag = %request.tag,
                bytes = request.bytes.len(),
                fds = request.fds.len(),
                "sending request"
            );
        }
        request.transmit(&mut self.session.channel)?;
        read_response(&mut self.session.channel, request.tag.reply_kind())
    }

    /// Consume whatever the helper still writes until it closes its side.
    fn drain(&mut self) {
        enter(SupervisorState::Draining);
        let channel: &mut ControlChannel = &mut self.session.channel;
        if let Err(err) = channel.set_read_timeout(Some(self.drain_timeout)) {
            debug!(operation = "dispatch_drain", error = %err, "cannot set drain timeout");
        }
        match channel.drain_to_eof() {
            Ok(bytes) => debug!(operation = "dispatch_drain", bytes = bytes, "helper closed the channel"),
            Err(err) => debug!(operation = "dispatch_drain", error = %err, "drain ended early"),
        }
    }

    fn shutdown(self) {
        self.broken.store(true, Ordering::Release);
        let HelperSession {
            channel,
            terminal,
            child,
            helper_pid,
        } = self.session;
        drop(channel);
        drop(terminal);
        if let Some(child) = child {
            supervisor::reap_helper(child, helper_pid);
        }
        info!(operation = "dispatch_exit", "dispatch thread finished");
    }
}
