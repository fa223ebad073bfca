//! Rank visually similar images between a source tree and one or more
//! target trees.
//!
//! [`services::ProjectRunner`] is the entry point: it indexes a project's
//! roots into a [`database::Store`], scores every source against every
//! target group and keeps the jobs cancellable.

pub mod config;
pub mod core;
pub mod database;
pub mod services;
pub mod workers;
