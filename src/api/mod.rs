//! Configuration/token management API (C11).

pub mod admin;
