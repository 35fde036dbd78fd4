pub mod config;
pub mod config_loader;
pub mod domain;
pub mod exec;
pub mod fs_tools;
pub mod mcp;
pub mod patch;
pub mod sandbox;
