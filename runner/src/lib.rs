pub mod assigner;
pub mod backend;
pub mod batcher;
pub mod catalog;
pub mod config;
pub mod jobs;
pub mod journal;
pub mod master;
pub mod protocol;
pub mod store;
pub mod tasks;
pub mod transport;
pub mod worker;
