//! Shared helpers: process bootstrap, retry policies and time sources.

pub mod bootstrap;
pub mod clock;
pub mod retry;
