//! Cloud adapter: the thin, testable seam in front of the object store.
//!
//! `client` defines the backend trait, `s3` implements it over aws-sdk-s3,
//! `memory` implements it in process for tests. `keys` owns path/key
//! mapping and `health` the reachability state machine.

pub mod client;
pub mod health;
pub mod keys;
pub mod memory;
pub mod s3;
