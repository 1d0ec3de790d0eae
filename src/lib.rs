//! A TFTP server (RFC 1350) over UDP.
//!
//! Clients download files with read requests and upload them with write requests. Data moves in
//! 512 byte blocks, each acknowledged before the next one is sent, with timeouts and bounded
//! retransmission covering lost packets.
//!
//! - [`tftp`]: packet codec and the UDP endpoint
//! - [`storage`]: byte sources and sinks the transfers read from and write to
//! - [`processor`]: what to do with each packet a peer sends
//! - [`srv_conn`]: one transfer session, from request to last block
//! - [`server`]: the listener that starts a session per request
//! - [`config`]: server configuration

pub mod config;
pub mod processor;
pub mod server;
pub mod srv_conn;
pub mod storage;
pub mod tftp;
