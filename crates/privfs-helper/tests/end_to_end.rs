// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Proxy and real helper binary, launched through `sh` as the current user.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::path::Path;
use std::time::Duration;

use privfs_client::{FileType, PrivilegedProxy, ProxyConfig, ProxyError};
use serial_test::serial;

fn helper_config() -> Option<ProxyConfig> {
    if !Path::new("/dev/ptmx").exists() {
        eprintln!("skipping: no pseudo-terminal support");
        return None;
    }
    // SAFETY: no preconditions.
    let uid = unsafe { libc::geteuid() };
    Some(
        ProxyConfig::builder()
            .elevation_command("sh")
            .helper_path(env!("CARGO_BIN_EXE_privfs-helper"))
            .expected_uid(uid)
            .handshake_timeout(Duration::from_secs(10))
            .secondary_timeout(Duration::from_secs(2))
            .debug(true)
            .build(),
    )
}

#[test]
#[serial]
fn full_session_against_real_helper() {
    let Some(config) = helper_config() else { return };
    let proxy = PrivilegedProxy::connect(config).expect("helper starts");
    assert!(proxy.helper_pid().is_some());

    let dir = tempfile::tempdir().unwrap();
    let base = File::open(dir.path()).unwrap();
    fs::write(dir.path().join("note"), "hello").unwrap();

    let fd = proxy.open(Some(base.as_fd()), Path::new("note"), libc::O_RDONLY).unwrap();
    let mut text = String::new();
    File::from(fd).read_to_string(&mut text).unwrap();
    assert_eq!(text, "hello");

    let created = dir.path().join("created");
    File::from(proxy.creat(&created, 0o600).unwrap())
        .write_all(b"via helper")
        .unwrap();
    assert_eq!(fs::read_to_string(&created).unwrap(), "via helper");

    proxy.mkdir(Some(base.as_fd()), Path::new("sub"), 0o755).unwrap();
    let err = proxy.mkdir(Some(base.as_fd()), Path::new("sub"), 0o755).unwrap_err();
    assert_eq!(err.errno(), Some(libc::EEXIST));

    proxy
        .rename(Some(base.as_fd()), Path::new("sub"), Some(base.as_fd()), Path::new("moved"), 0)
        .unwrap();
    proxy
        .link(Some(base.as_fd()), Path::new("note"), Some(base.as_fd()), Path::new("hard"), 0)
        .unwrap();
    std::os::unix::fs::symlink("note", dir.path().join("sym")).unwrap();
    assert_eq!(
        proxy.readlink(Some(base.as_fd()), Path::new("sym")).unwrap(),
        Path::new("note")
    );

    assert!(proxy.faccess(Some(base.as_fd()), Path::new("note"), libc::R_OK).unwrap());
    let stat = proxy.fstatat(Some(base.as_fd()), Path::new("hard"), 0).unwrap();
    assert_eq!(stat.size, 5);
    assert_eq!(stat.file_type, FileType::Regular);
    assert!(proxy.fstat(base.as_fd()).unwrap().is_dir());

    proxy
        .unlink(Some(base.as_fd()), Path::new("moved"), libc::AT_REMOVEDIR)
        .unwrap();
    assert!(!dir.path().join("moved").exists());

    assert!(proxy.init().unwrap().is_some());
    proxy.cleanup().unwrap();
    proxy.close();
    assert!(proxy.is_closed());
}

#[test]
#[serial]
fn killed_helper_breaks_the_proxy() {
    let Some(config) = helper_config() else { return };
    let proxy = PrivilegedProxy::connect(config).expect("helper starts");
    let pid = proxy.helper_pid().expect("helper pid") as libc::pid_t;

    // SAFETY: signalling our own child.
    assert_eq!(unsafe { libc::kill(pid, libc::SIGKILL) }, 0);
    std::thread::sleep(Duration::from_millis(200));

    let err = proxy.cleanup().unwrap_err();
    assert!(err.is_broken(), "{err:?}");
    assert!(matches!(proxy.init(), Err(ProxyError::FactoryBroken(_))));
}

#[test]
#[serial]
fn missing_helper_binary_is_a_startup_error() {
    let Some(config) = helper_config() else { return };
    let config = ProxyConfig {
        helper_path: "/nonexistent/privfs-helper".into(),
        handshake_timeout_ms: 3000,
        ..config
    };
    match PrivilegedProxy::connect(config) {
        Err(ProxyError::Startup(_)) => {}
        other => panic!("expected startup error, got {other:?}"),
    }
}
