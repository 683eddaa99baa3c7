pub mod buffer;
pub mod checksum;
pub mod config;
pub mod csc_endpoint;
pub mod duplicates;
pub mod event;
pub mod mapping;
pub mod pipeline;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod time;
pub mod utils;
