// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for the provisioner's command-line programs

use std::path::Path;
use std::process::exit;

/// Why a command-line program is giving up
#[derive(Debug, thiserror::Error)]
pub enum CmdError {
    /// the arguments don't make sense together
    #[error("{0}")]
    Usage(String),
    /// anything that went wrong while doing the work
    #[error("{0:#}")]
    Failure(anyhow::Error),
}

impl CmdError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CmdError::Usage(_) => 2,
            CmdError::Failure(_) => 1,
        }
    }
}

impl From<anyhow::Error> for CmdError {
    fn from(error: anyhow::Error) -> Self {
        CmdError::Failure(error)
    }
}

/// Prints `error` after the program's name and exits with the matching
/// status
pub fn fatal(error: CmdError) -> ! {
    let program = std::env::current_exe().ok();
    let program = program
        .as_deref()
        .and_then(Path::file_stem)
        .and_then(|stem| stem.to_str())
        .unwrap_or("provisioner");
    eprintln!("{program}: {error}");
    exit(error.exit_code());
}
