//! Subgate - subscription verification gate for community chat guilds
//!
//! Users joining a guild may already carry subscription-entitlement roles
//! (assigned by a partner integration). The gate holds those roles back until
//! the user completes verification, then restores them and makes sure they
//! stick.
//!
//! Key principles:
//! - Entitlements are never lost: every held role is owed back or discarded
//!   on departure
//! - Re-assignments before verification are blocked, not silently accepted
//! - All tracking is in-memory; the platform stays the source of truth

pub mod config;
pub mod gatekeeper;
pub mod platform;
