// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deciding what a cluster should look like and how to get it there
//!
//! [`layout`] maps services onto nodes.  [`plan`] turns the difference
//! between a cluster's current and target layout into an ordered set of
//! units of work.  Both are pure: they read their inputs and touch nothing
//! else.

pub mod layout;
pub mod plan;
