// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process stand-in for the privileged helper.

#![allow(dead_code)]

use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use privfs_client::{PrivilegedProxy, ProxyConfig};
use privfs_proto::{read_request, ControlChannel, HelperReply, OpTag, WireRequest};

pub enum Action {
    Reply(HelperReply),
    /// Sleep without answering, then keep serving.
    Stall(Duration),
    /// Close the helper side of the socket.
    Disconnect,
}

pub fn test_config() -> ProxyConfig {
    ProxyConfig::builder()
        .primary_timeout(Duration::from_secs(5))
        .secondary_timeout(Duration::from_millis(1500))
        .debug(true)
        .build()
}

/// Attach a proxy to a thread that answers with `handler`.
///
/// The thread returns the tags of every request it decoded.
pub fn spawn_fake_helper<F>(
    config: ProxyConfig,
    mut handler: F,
) -> (PrivilegedProxy, JoinHandle<Vec<OpTag>>)
where
    F: FnMut(&WireRequest) -> Action + Send + 'static,
{
    let (ours, theirs) = UnixStream::pair().expect("socketpair");
    let helper = thread::spawn(move || {
        let mut channel = ControlChannel::new(theirs);
        let mut seen = Vec::new();
        while let Ok(Some(request)) = read_request(&mut channel) {
            seen.push(request.tag);
            match handler(&request) {
                Action::Reply(reply) => {
                    if reply.write_to(&mut channel).is_err() {
                        break;
                    }
                }
                Action::Stall(duration) => thread::sleep(duration),
                Action::Disconnect => break,
            }
        }
        seen
    });
    let proxy = PrivilegedProxy::attach(config, ours).expect("attach proxy");
    (proxy, helper)
}

pub fn path_str(request: &WireRequest, index: usize) -> String {
    String::from_utf8_lossy(request.path(index)).into_owned()
}
