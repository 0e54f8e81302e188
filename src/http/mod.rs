//! HTTP surface of the listener
//!
//! Health and discovery endpoints plus the entry points of the two network transports.

pub mod handlers;
