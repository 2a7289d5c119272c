// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Proxy attached to a helper server running on a thread of this process.

use std::fs::{self, File};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use privfs_client::{PrivilegedProxy, ProxyConfig};
use privfs_helper::HelperServer;

fn attached_proxy() -> (PrivilegedProxy, thread::JoinHandle<u64>) {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let server = thread::spawn(move || HelperServer::new(theirs).serve().unwrap());
    let config = ProxyConfig::builder()
        .secondary_timeout(Duration::from_secs(2))
        .build();
    (PrivilegedProxy::attach(config, ours).unwrap(), server)
}

#[test]
fn second_base_is_honoured_without_a_first() {
    let src = tempfile::tempdir().unwrap();
    let dst = tempfile::tempdir().unwrap();
    let orig = src.path().join("orig");
    fs::write(&orig, "payload").unwrap();
    let dst_dir = File::open(dst.path()).unwrap();

    let (proxy, server) = attached_proxy();
    proxy
        .link(None, &orig, Some(dst_dir.as_fd()), Path::new("copy"), 0)
        .unwrap();
    assert_eq!(fs::read_to_string(dst.path().join("copy")).unwrap(), "payload");

    proxy
        .rename(None, &orig, Some(dst_dir.as_fd()), Path::new("moved"), 0)
        .unwrap();
    assert!(!orig.exists());
    assert_eq!(fs::read_to_string(dst.path().join("moved")).unwrap(), "payload");

    proxy.close();
    assert_eq!(server.join().unwrap(), 2);
}
