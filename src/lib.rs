//! Observe Deploy - idempotent installer and configuration deployer for the
//! Observe telemetry agent on Debian-family hosts
//!
//! This crate sequences the install and update workflows as discrete stages
//! with an explicit changed/unchanged contract, timestamped configuration
//! backups, and best-effort rollback on mid-sequence failure.

pub mod cmd;
pub mod error;
pub mod facts;
pub mod outcome;
pub mod stages;
pub mod vars;
pub mod workflow;
