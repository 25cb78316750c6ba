//! API Routes
//!
//! Route handlers organized by functionality.

pub mod health;
pub mod index;
pub mod ingest;
pub mod snapshot;
