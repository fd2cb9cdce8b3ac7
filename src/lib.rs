pub mod album;
pub mod buffer;
pub mod channels;
pub mod config;
pub mod error;
