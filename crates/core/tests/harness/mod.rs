//! Shared helpers for media engine integration tests

#![allow(dead_code)]

use bytes::{BufMut, Bytes, BytesMut};
use peermux_core::PeerAddress;

/// Initialize test logging (call once per test)
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,peermux_core=debug")
        .try_init();
}

/// Insert the sender prefix the relay adds when forwarding a frame
pub fn relay_forward(frame: &[u8], from: &PeerAddress) -> Bytes {
    let ip = from.to_ipv4_bytes().expect("test peers are IPv4");
    let mut buf = BytesMut::with_capacity(frame.len() + ip.len());
    buf.put_u8(frame[0]);
    buf.put_slice(&ip);
    buf.put_slice(&frame[1..]);
    buf.freeze()
}
