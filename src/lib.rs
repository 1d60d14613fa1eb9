//! Book Mirror Library
//!
//! Keeps a local replica of exchange order books in sync with the upstream
//! streaming feed and serves point-in-time snapshots of it over HTTP.

pub mod api;
pub mod catalog;
pub mod config;
pub mod feed;
pub mod middleware;
pub mod query;
pub mod store;
