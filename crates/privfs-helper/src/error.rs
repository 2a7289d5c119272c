// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use privfs_proto::FrameError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HelperError {
    #[error("cannot connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("terminal setup failed: {0}")]
    Terminal(String),

    #[error("expected release line, got {0:?}")]
    Release(String),

    #[error("control channel: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type HelperResult<T> = Result<T, HelperError>;

impl From<nix::Error> for HelperError {
    fn from(err: nix::Error) -> Self {
        HelperError::Terminal(err.desc().to_string())
    }
}
