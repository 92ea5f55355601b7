pub mod collector;
pub mod config;
pub mod distributed;
pub mod executors;
pub mod process;
pub mod scan;
