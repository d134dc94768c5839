// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Cluster provisioner common facilities
//!
//! This crate implements facilities used by every other crate in the
//! provisioner workspace: the error type that user-facing operations return,
//! typed identifiers for the provisioner's records, and helpers for
//! command-line programs.

pub mod api;
pub mod cmd;
pub mod typed_uuid;
