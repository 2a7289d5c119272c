// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Unprivileged side of privfs.
//!
//! [`PrivilegedProxy`] launches a helper through an elevation command (`su`
//! by default), hands it requests one at a time over a Unix socket and
//! returns the results, including descriptors the helper opened.
//!
//! ```no_run
//! use privfs_client::{PrivilegedProxy, ProxyConfig};
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let proxy = PrivilegedProxy::connect(ProxyConfig::load(None)?)?;
//!     let fd = proxy.open(None, Path::new("/etc/shadow"), libc::O_RDONLY)?;
//!     drop(fd);
//!     proxy.close();
//!     Ok(())
//! }
//! ```

pub mod config;
mod dispatch;
pub mod error;
pub mod fs;
pub mod guard;
pub mod proxy;
pub mod session;
pub mod supervisor;

pub use config::ProxyConfig;
pub use error::{ProxyError, ProxyResult};
pub use fs::{EscalatingFs, FsOps, LocalFs};
pub use privfs_proto::{FileType, StatSnapshot};
pub use proxy::PrivilegedProxy;
pub use session::SessionSlot;
pub use supervisor::SupervisorState;
