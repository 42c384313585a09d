//! Workflow stage executors
//!
//! One module per stage of the install/update sequence. Each stage returns
//! the shared changed/unchanged contract from [`crate::outcome`] and wraps
//! its failures in the taxonomy from [`crate::error`].

pub mod backup;
pub mod deploy;
pub mod directory;
pub mod init;
pub mod log_exclude;
pub mod package;
pub mod repo;
pub mod service;
