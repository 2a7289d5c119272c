// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::os::unix::net::UnixStream;

use privfs_proto::{read_request, ControlChannel};
use tracing::{debug, error, info};

use crate::error::HelperResult;
use crate::ops;

/// Serves requests from one proxy until it closes the channel.
pub struct HelperServer {
    channel: ControlChannel,
    served: u64,
}

impl HelperServer {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            channel: ControlChannel::new(stream),
            served: 0,
        }
    }

    /// Run the request loop; returns the number of requests served.
    pub fn serve(mut self) -> HelperResult<u64> {
        info!(operation = "helper_serve", "serving requests");
        loop {
            let request = match read_request(&mut self.channel) {
                Ok(Some(request)) => request,
                Ok(None) => {
                    info!(operation = "helper_serve", served = self.served, "proxy closed the channel");
                    return Ok(self.served);
                }
                Err(err) => {
                    error!(operation = "helper_serve", error = %err, "cannot decode request");
                    return Err(err.into());
                }
            };

            let reply = ops::execute(&request);
            debug!(
                operation = "helper_request",
                tag = %request.tag,
                fds = request.fds.len(),
                success = reply.is_success(),
                "request handled"
            );
            reply.write_to(&mut self.channel)?;
            // Received descriptors close here.
            drop(request);
            self.served += 1;
        }
    }
}
