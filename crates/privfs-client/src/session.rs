// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lazily created, shared privileged proxy.
//!
//! The slot builds a proxy on first use and hands out the same instance until
//! it breaks; the next request after that builds a fresh one.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use privfs_proto::StatSnapshot;
use tracing::{info, warn};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::fs::FsOps;
use crate::proxy::PrivilegedProxy;

type Connector = dyn Fn(&ProxyConfig) -> ProxyResult<PrivilegedProxy> + Send + Sync;

pub struct SessionSlot {
    config: ProxyConfig,
    current: Mutex<Option<Arc<PrivilegedProxy>>>,
    connector: Box<Connector>,
}

impl std::fmt::Debug for SessionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSlot")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SessionSlot {
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_connector(config, |config| PrivilegedProxy::connect(config.clone()))
    }

    /// Use `connector` to build proxies instead of launching the helper.
    pub fn with_connector<F>(config: ProxyConfig, connector: F) -> Self
    where
        F: Fn(&ProxyConfig) -> ProxyResult<PrivilegedProxy> + Send + Sync + 'static,
    {
        Self {
            config,
            current: Mutex::new(None),
            connector: Box::new(connector),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<PrivilegedProxy>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The live proxy, building one if there is none or the last one broke.
    ///
    /// Concurrent callers wait on the slot, so at most one proxy is built.
    pub fn get(&self) -> ProxyResult<Arc<PrivilegedProxy>> {
        let mut slot = self.lock();
        if let Some(proxy) = slot.as_ref() {
            if !proxy.is_closed() {
                return Ok(proxy.clone());
            }
            info!(operation = "session_replace", "previous proxy is closed, starting a new one");
        }
        let proxy = Arc::new((self.connector)(&self.config)?);
        *slot = Some(proxy.clone());
        Ok(proxy)
    }

    /// The live proxy, without building one.
    pub fn current(&self) -> Option<Arc<PrivilegedProxy>> {
        self.lock().as_ref().filter(|p| !p.is_closed()).cloned()
    }

    /// Close and forget the current proxy.
    pub fn invalidate(&self) {
        if let Some(proxy) = self.lock().take() {
            proxy.close();
        }
    }

    fn with_proxy<T>(&self, run: impl FnOnce(&PrivilegedProxy) -> ProxyResult<T>) -> ProxyResult<T> {
        let proxy = self.get()?;
        let result = run(&proxy);
        if let Err(err) = &result {
            if err.is_broken() {
                warn!(operation = "session_call", error = %err, "privileged session lost");
                self.invalidate();
            }
        }
        result
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.invalidate();
    }
}

impl FsOps for SessionSlot {
    fn open(&self, path: &Path, flags: i32) -> ProxyResult<OwnedFd> {
        self.with_proxy(|p| FsOps::open(p, path, flags))
    }

    fn creat(&self, path: &Path, mode: u32) -> ProxyResult<OwnedFd> {
        self.with_proxy(|p| FsOps::creat(p, path, mode))
    }

    fn mkdir(&self, path: &Path, mode: u32) -> ProxyResult<()> {
        self.with_proxy(|p| FsOps::mkdir(p, path, mode))
    }

    fn unlink(&self, path: &Path, flags: i32) -> ProxyResult<()> {
        self.with_proxy(|p| FsOps::unlink(p, path, flags))
    }

    fn rename(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        self.with_proxy(|p| FsOps::rename(p, from, to))
    }

    fn link(&self, from: &Path, to: &Path) -> ProxyResult<()> {
        self.with_proxy(|p| FsOps::link(p, from, to))
    }

    fn readlink(&self, path: &Path) -> ProxyResult<PathBuf> {
        self.with_proxy(|p| FsOps::readlink(p, path))
    }

    fn faccess(&self, path: &Path, mode: i32) -> ProxyResult<bool> {
        self.with_proxy(|p| FsOps::faccess(p, path, mode))
    }

    fn fstat(&self, fd: BorrowedFd<'_>) -> ProxyResult<StatSnapshot> {
        self.with_proxy(|p| FsOps::fstat(p, fd))
    }

    fn stat(&self, path: &Path, follow_symlinks: bool) -> ProxyResult<StatSnapshot> {
        self.with_proxy(|p| FsOps::stat(p, path, follow_symlinks))
    }
}
