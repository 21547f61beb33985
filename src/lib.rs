pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod fetch;
pub mod materialize;
pub mod output;
pub mod preload;
pub mod progress;
pub mod store;
pub mod transport;
pub mod unpack;
