//! CLI command implementations.

pub mod chunks;
pub mod init;
pub mod invite;
pub mod simulate;
