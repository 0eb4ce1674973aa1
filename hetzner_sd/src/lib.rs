//! Prometheus `file_sd` service discovery for Hetzner Robot servers.
//!
//! This library supports the `prometheus-hetzner-sd` binary found elsewhere in
//! this project. The daemon polls the Robot webservice for the dedicated
//! servers of one or more projects, writes them as target groups to a file
//! Prometheus watches and exposes its own telemetry over HTTP.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod adapter;
pub mod config;
pub mod discovery;
pub mod robot;
pub mod web;
