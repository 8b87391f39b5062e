//! Job lifecycle client and proxy server for the GPU inference tools.

pub mod config;
pub mod decode;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod examples_catalog;
pub mod fields;
pub mod http;
pub mod job;
pub mod livekit;
pub mod logging;
pub mod poller;
pub mod proxy_client;
pub mod server;
pub mod session;
pub mod settings;
pub mod tool;
pub mod upload;
pub mod upstream;
