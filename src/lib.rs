pub mod config;
pub mod feed;
pub mod storage;
pub mod sync;
