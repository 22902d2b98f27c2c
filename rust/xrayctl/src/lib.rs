//! Manage an xray confdir of JSON fragments.
//!
//! [`manager::Manager`] is the entry point: it adds, updates and removes
//! protocol units, each change wrapped in snapshot, validate and rollback.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fragments;
pub mod keys;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod notify;
pub mod ports;
pub mod share;
pub mod shell;
pub mod template;
pub mod validator;
