pub mod channel;
pub mod cli;
pub mod config;
pub mod device;
pub mod log;
pub mod sender;
pub mod storage;
