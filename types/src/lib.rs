// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data model for the cluster provisioner
//!
//! Templates and service specs describe what a cluster may contain; clusters,
//! nodes, jobs, and tasks record what it does contain and what is being done
//! to it.

pub mod cluster;
pub mod codec;
pub mod job;
pub mod service;
pub mod task;
pub mod template;
