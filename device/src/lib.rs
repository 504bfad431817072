//! OneNET cloud client for the ExDebugTool device: activation, request
//! tokens, the file upload queue and device-level reporting.

pub mod activation;
pub mod cloud;
pub mod config;
pub mod credentials;
pub mod error;
pub mod link;
pub mod net;
pub mod queue;
pub mod simulate;
pub mod stats;
pub mod storage;
pub mod telemetry;
pub mod token;
pub mod types;
pub mod uploader;

#[cfg(test)]
pub(crate) mod test_support;
