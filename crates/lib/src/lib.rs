//! Harbor core library — gateway, agent orchestration, model backends,
//! channels, and skills shared by the CLI and the server.

pub mod agent;
pub mod channels;
pub mod config;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod skills;
pub mod tools;
