//! pair-scheduler: dedicated request-serving node scheduling for hosted
//! control planes
//!
//! Binds each hosted cluster to a pair of same-sized nodes in distinct zones,
//! keeps a warm pool of placeholder deployments holding spare pairs, and
//! deletes claimed nodes once their hosted cluster is gone.

pub mod controller;
pub mod crd;
pub mod error;
pub mod leader_election;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
