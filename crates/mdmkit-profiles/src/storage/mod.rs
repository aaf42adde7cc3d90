//! `SQLite` storage for the mdmkit profile engine.
//!
//! Provides persistence for hosts and their identity attributes, profile
//! templates, per-host delivery state, managed certificates, and the MDM
//! command queue.

mod db;
mod models;
mod queries_commands;
mod queries_hosts;
mod queries_profiles;


pub use db::MdmDatabase;
pub use mdmkit_core::db::DatabaseError;
pub use models::*;
pub use queries_commands::{EnrollmentParams, NewCommand};
pub use queries_hosts::{IDP_EMAIL_SOURCE, NewHostParams};
pub use queries_profiles::{HostProfileUpdate, NewProfileParams};
