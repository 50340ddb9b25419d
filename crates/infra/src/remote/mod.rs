//! HTTP adapter for the remote system of record

pub mod http_store;

pub use http_store::{HttpRemoteStore, RemoteClientConfig, REPLAY_HEADER};
