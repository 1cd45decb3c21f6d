//! Data-staging engine: a transfer request scheduler and the generator that
//! turns jobs' file lists into transfer requests.

pub mod cache;
pub mod checksum;
pub mod config;
pub mod delivery;
pub mod dtr;
pub mod file_list;
pub mod generator;
pub mod job;
pub mod logging;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod share;
pub mod url_model;
