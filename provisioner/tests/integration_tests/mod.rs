//! Provisioner integration tests
//!
//! See the driver in the parent directory for how and why this is structured
//! the way it is.

mod clusters;
mod leases;
mod ordering;
mod recovery;
mod retries;
