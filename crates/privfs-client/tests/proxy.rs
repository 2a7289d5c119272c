// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Proxy behaviour against an in-process helper.

mod support;

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::os::unix::fs::MetadataExt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use privfs_client::{FileType, FsOps, PrivilegedProxy, ProxyConfig, ProxyError, StatSnapshot};
use privfs_proto::{fdpass, HelperReply, OpTag};
use support::{path_str, spawn_fake_helper, test_config, Action};

fn file_with(contents: &str) -> OwnedFd {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file.rewind().unwrap();
    OwnedFd::from(file)
}

fn read_all(fd: OwnedFd) -> String {
    let mut text = String::new();
    File::from(fd).read_to_string(&mut text).unwrap();
    text
}

#[test]
fn open_sends_exact_record_and_returns_descriptor() {
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let helper = thread::spawn(move || {
        let expected = b"OPEN\n0 0 12 /data/secret\n";
        let mut got = vec![0u8; expected.len()];
        theirs.read_exact(&mut got).unwrap();
        let fd = file_with("classified");
        fdpass::send_with_fd(&theirs, b"READY\0", fd.as_fd()).unwrap();
        got
    });

    let proxy = PrivilegedProxy::attach(test_config(), ours).unwrap();
    let fd = proxy.open(None, Path::new("/data/secret"), 0).unwrap();
    assert_eq!(read_all(fd), "classified");
    assert_eq!(helper.join().unwrap(), b"OPEN\n0 0 12 /data/secret\n".to_vec());
    proxy.close();
}

#[test]
fn errno_reply_keeps_proxy_usable() {
    let mut first = true;
    let (proxy, helper) = spawn_fake_helper(test_config(), move |request| {
        assert_eq!(request.tag, OpTag::Mkdir);
        if std::mem::take(&mut first) {
            Action::Reply(HelperReply::Failure("13 Permission denied".into()))
        } else {
            Action::Reply(HelperReply::Ready)
        }
    });

    let err = proxy.mkdir(None, Path::new("/root/locked"), 0o700).unwrap_err();
    match err {
        ProxyError::Errno { code, message } => {
            assert_eq!(code, libc::EACCES);
            assert_eq!(message, "Permission denied");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!proxy.is_closed());

    proxy.mkdir(None, Path::new("/root/locked"), 0o700).unwrap();
    proxy.close();
    assert_eq!(helper.join().unwrap(), vec![OpTag::Mkdir, OpTag::Mkdir]);
}

#[test]
fn protocol_error_breaks_proxy_for_good() {
    let (proxy, helper) = spawn_fake_helper(test_config(), |_| {
        Action::Reply(HelperReply::Failure("Disconnected".into()))
    });

    let err = proxy.unlink(None, Path::new("/tmp/x"), 0).unwrap_err();
    assert!(err.is_broken(), "{err:?}");
    assert!(proxy.is_closed());

    let started = Instant::now();
    let err = proxy.unlink(None, Path::new("/tmp/y"), 0).unwrap_err();
    assert!(err.is_broken());
    assert!(started.elapsed() < Duration::from_millis(100));

    assert_eq!(helper.join().unwrap(), vec![OpTag::Unlink]);
}

#[test]
fn helper_disconnect_breaks_proxy() {
    let (proxy, helper) = spawn_fake_helper(test_config(), |_| Action::Disconnect);

    let err = proxy.cleanup().unwrap_err();
    match &err {
        ProxyError::FactoryBroken(reason) => assert!(reason.starts_with("Disconnected"), "{reason}"),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(proxy.init().unwrap_err().is_broken());
    helper.join().unwrap();
}

#[test]
fn missing_descriptor_on_open_breaks_proxy() {
    let (proxy, helper) = spawn_fake_helper(test_config(), |_| Action::Reply(HelperReply::Ready));
    let err = proxy.open(None, Path::new("/etc/shadow"), 0).unwrap_err();
    assert!(err.is_broken());
    drop(proxy);
    helper.join().unwrap();
}

#[test]
fn slow_reply_times_out_and_breaks_proxy() {
    let config = ProxyConfig::builder()
        .primary_timeout(Duration::from_secs(2))
        .secondary_timeout(Duration::from_millis(200))
        .build();
    let (proxy, helper) = spawn_fake_helper(config, |_| Action::Stall(Duration::from_millis(800)));

    let err = proxy.faccess(None, Path::new("/root"), libc::R_OK).unwrap_err();
    match err {
        ProxyError::FactoryBroken(reason) => assert!(reason.contains("timed out"), "{reason}"),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(proxy.is_closed());
    helper.join().unwrap();
}

#[test]
fn faccess_maps_eacces_to_false() {
    let (proxy, _helper) = spawn_fake_helper(test_config(), |request| {
        if request.path(0) == b"/denied" {
            Action::Reply(HelperReply::Failure("13 Permission denied".into()))
        } else if request.path(0) == b"/missing" {
            Action::Reply(HelperReply::Failure("2 No such file or directory".into()))
        } else {
            Action::Reply(HelperReply::Ready)
        }
    });

    assert!(proxy.faccess(None, Path::new("/allowed"), libc::W_OK).unwrap());
    assert!(!proxy.faccess(None, Path::new("/denied"), libc::W_OK).unwrap());
    let err = proxy.faccess(None, Path::new("/missing"), libc::W_OK).unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOENT));
    assert!(!proxy.is_closed());
}

#[test]
fn structured_replies_reach_the_caller() {
    let snapshot = StatSnapshot {
        dev: 8,
        ino: 1234,
        size: 42,
        file_type: FileType::Directory,
        blksize: 4096,
    };
    let (proxy, _helper) = spawn_fake_helper(test_config(), move |request| match request.tag {
        OpTag::Readlink => Action::Reply(HelperReply::ReadyWithText(b"/real/target".to_vec())),
        OpTag::Fstat if request.path(0) == b"/nope" => {
            Action::Reply(HelperReply::StatFailure("2 No such file or directory".into()))
        }
        OpTag::Fstat => {
            assert_eq!(request.fds.len(), 1);
            Action::Reply(HelperReply::Stat(snapshot))
        }
        OpTag::AddWatch => {
            assert_eq!(request.fds.len(), 1);
            assert_eq!(request.arg(0), libc::IN_CREATE as i32);
            Action::Reply(HelperReply::WatchId(3))
        }
        _ => Action::Reply(HelperReply::Failure("95 Operation not supported".into())),
    });

    assert_eq!(
        proxy.readlink(None, Path::new("/link")).unwrap(),
        PathBuf::from("/real/target")
    );

    let target = tempfile::tempfile().unwrap();
    assert_eq!(proxy.fstat(target.as_fd()).unwrap(), snapshot);
    assert_eq!(FsOps::stat(&proxy, Path::new("/etc"), true).unwrap(), snapshot);
    let err = proxy.fstatat(Some(target.as_fd()), Path::new("/nope"), 0).unwrap_err();
    assert_eq!(err.errno(), Some(libc::ENOENT));

    let inotify = tempfile::tempfile().unwrap();
    let id = proxy
        .add_watch(inotify.as_fd(), None, Path::new("/var/log"), libc::IN_CREATE)
        .unwrap();
    assert_eq!(id, 3);

    let err = proxy.link(None, Path::new("a"), None, Path::new("b"), 0).unwrap_err();
    assert_eq!(err.errno(), Some(libc::EOPNOTSUPP));
    assert!(!proxy.is_closed());
}

#[test]
fn base_descriptors_travel_with_two_path_requests() {
    let (proxy, helper) = spawn_fake_helper(test_config(), |request| {
        assert_eq!(request.tag, OpTag::Rename);
        assert_eq!(request.fds.len(), 2);
        assert_eq!(path_str(request, 0), "old name");
        assert_eq!(path_str(request, 1), "new name");
        assert_eq!(request.arg(0), 1);
        Action::Reply(HelperReply::Ready)
    });

    let from = tempfile::tempdir().unwrap();
    let to = tempfile::tempdir().unwrap();
    let from_fd = File::open(from.path()).unwrap();
    let to_fd = File::open(to.path()).unwrap();
    proxy
        .rename(
            Some(from_fd.as_fd()),
            Path::new("old name"),
            Some(to_fd.as_fd()),
            Path::new("new name"),
            1,
        )
        .unwrap();
    proxy.close();
    assert_eq!(helper.join().unwrap(), vec![OpTag::Rename]);
}

#[test]
fn invalid_arguments_are_rejected_without_breaking() {
    let (proxy, helper) = spawn_fake_helper(test_config(), |_| Action::Reply(HelperReply::Ready));

    let err = proxy.mkdir(None, Path::new(""), 0o755).unwrap_err();
    assert!(matches!(err, ProxyError::InvalidArgument(_)));
    let err = proxy
        .mknod(None, Path::new("/dev/x"), libc::S_IFCHR as u32, u64::MAX)
        .unwrap_err();
    assert!(matches!(err, ProxyError::InvalidArgument(_)));

    assert!(!proxy.is_closed());
    proxy.cleanup().unwrap();
    proxy.close();
    assert_eq!(helper.join().unwrap(), vec![OpTag::Cleanup]);
}

#[test]
fn concurrent_callers_are_served_in_order() {
    const THREADS: usize = 8;
    const CALLS: usize = 20;

    let served = Arc::new(Mutex::new(Vec::new()));
    let log = served.clone();
    let (proxy, helper) = spawn_fake_helper(test_config(), move |request| {
        assert_eq!(request.tag, OpTag::Readlink);
        let path = path_str(request, 0);
        let expected_fds = usize::from(path.ends_with("/b"));
        assert_eq!(request.fds.len(), expected_fds, "{path}");
        let mut log = log.lock().unwrap();
        let seq = log.len();
        log.push(path.clone());
        Action::Reply(HelperReply::ReadyWithText(format!("{seq}:{path}").into_bytes()))
    });
    let proxy = Arc::new(proxy);
    let base = Arc::new(tempfile::tempdir().unwrap());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let proxy = proxy.clone();
            let base = base.clone();
            thread::spawn(move || {
                let dir = File::open(base.path()).unwrap();
                let mut answered = Vec::new();
                for i in 0..CALLS {
                    let with_base = i % 2 == 0;
                    let path = if with_base {
                        format!("/t{t}/{i}/b")
                    } else {
                        format!("/t{t}/{i}/n")
                    };
                    let fd = with_base.then(|| dir.as_fd());
                    let target = proxy.readlink(fd, Path::new(&path)).unwrap();
                    let target = target.to_str().unwrap().to_string();
                    let (seq, echoed) = target.split_once(':').unwrap();
                    assert_eq!(echoed, path);
                    answered.push((seq.parse::<usize>().unwrap(), path));
                }
                answered
            })
        })
        .collect();
    let answered: Vec<Vec<(usize, String)>> =
        workers.into_iter().map(|w| w.join().unwrap()).collect();

    proxy.close();
    assert_eq!(helper.join().unwrap().len(), THREADS * CALLS);
    let served = served.lock().unwrap();
    assert_eq!(served.len(), THREADS * CALLS);
    for calls in &answered {
        // Each caller's requests reached the helper in the order it issued them.
        assert!(calls.windows(2).all(|pair| pair[0].0 < pair[1].0), "{calls:?}");
        for (seq, path) in calls {
            assert_eq!(&served[*seq], path);
        }
    }
    let distinct: HashSet<usize> = answered.iter().flatten().map(|(seq, _)| *seq).collect();
    assert_eq!(distinct.len(), THREADS * CALLS);
}

#[test]
fn second_base_keeps_its_slot_without_a_first() {
    fn identity(fd: std::os::fd::BorrowedFd<'_>) -> (u64, u64) {
        let meta = File::from(fd.try_clone_to_owned().unwrap()).metadata().unwrap();
        (meta.dev(), meta.ino())
    }

    let dst = tempfile::tempdir().unwrap();
    let dst_dir = File::open(dst.path()).unwrap();
    let dst_id = identity(dst_dir.as_fd());
    let cwd = std::fs::metadata(".").unwrap();
    let cwd_id = (cwd.dev(), cwd.ino());

    let (proxy, helper) = spawn_fake_helper(test_config(), move |request| {
        assert_eq!(request.fds.len(), 2);
        assert_eq!(identity(request.fd(0).unwrap()), cwd_id);
        assert_eq!(identity(request.fd(1).unwrap()), dst_id);
        assert_eq!(path_str(request, 1), "copy");
        Action::Reply(HelperReply::Ready)
    });

    proxy
        .link(None, Path::new("orig"), Some(dst_dir.as_fd()), Path::new("copy"), 0)
        .unwrap();
    proxy
        .rename(None, Path::new("orig"), Some(dst_dir.as_fd()), Path::new("copy"), 0)
        .unwrap();
    proxy.close();
    assert_eq!(helper.join().unwrap(), vec![OpTag::Link, OpTag::Rename]);
}

#[test]
fn close_is_idempotent_across_threads() {
    let (proxy, helper) = spawn_fake_helper(test_config(), |_| Action::Reply(HelperReply::Ready));
    let proxy = Arc::new(proxy);
    proxy.cleanup().unwrap();

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let proxy = proxy.clone();
            thread::spawn(move || proxy.close())
        })
        .collect();
    for closer in closers {
        closer.join().unwrap();
    }

    assert!(proxy.is_closed());
    assert!(proxy.cleanup().unwrap_err().is_broken());
    proxy.close();
    assert_eq!(helper.join().unwrap(), vec![OpTag::Cleanup]);
}

#[test]
fn init_returns_optional_descriptor() {
    let mut calls = 0;
    let (proxy, _helper) = spawn_fake_helper(test_config(), move |_| {
        calls += 1;
        if calls == 1 {
            Action::Reply(HelperReply::ReadyWithFd(file_with("")))
        } else {
            Action::Reply(HelperReply::Ready)
        }
    });
    let fd = proxy.init().unwrap().expect("self-test descriptor");
    File::from(fd).write_all(b"sentinel").unwrap();
    assert!(proxy.init().unwrap().is_none());
}

#[test]
fn distinct_requests_carry_distinct_paths() {
    let seen = Arc::new(Mutex::new(HashSet::new()));
    let record = seen.clone();
    let (proxy, _helper) = spawn_fake_helper(test_config(), move |request| {
        record.lock().unwrap().insert(path_str(request, 0));
        Action::Reply(HelperReply::ReadyWithFd(file_with("x")))
    });
    for name in ["/a", "/b", "/c"] {
        drop(proxy.creat(Path::new(name), 0o600).unwrap());
    }
    proxy.close();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 3);
    assert!(seen.contains("/b"));
}
