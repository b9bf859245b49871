//! # Commands Module
//!
//! The two command handlers for drift:
//!
//! ## `serve`
//! Runs a single storage node:
//! - Parses or generates the cluster encryption key
//! - Binds the listen address and dials the bootstrap peers
//! - Serves store/get traffic until interrupted
//!
//! ## `demo`
//! Brings up a two-node cluster on localhost, stores ten keys through
//! one node, and reads them back from the other.

pub mod demo;
pub mod serve;
