pub mod config;
pub mod fuse;
