//! Shared fixtures for the engine integration tests

#![allow(dead_code)]

use flow_tracker::events::{ConnEventKind, ConnectionEvent};
use flow_tracker::{
    Direction, Engine, EngineConfig, KernelEvent, StatsDelta, Transport, Tuple,
};
use std::net::{IpAddr, Ipv4Addr};

pub fn engine() -> Engine {
    Engine::new(EngineConfig::default()).unwrap()
}

pub fn engine_with(config: EngineConfig) -> Engine {
    Engine::new(config).unwrap()
}

pub fn v4(a: [u8; 4]) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(a))
}

/// Client socket 10.0.0.1:sport talking to dst:dport over TCP
pub fn client_tuple(sport: u16, dst: [u8; 4], dport: u16) -> Tuple {
    Tuple::new(v4([10, 0, 0, 1]), sport, v4(dst), dport, 1, Transport::Tcp)
}

pub fn conn(kind: ConnEventKind, tuple: Tuple, cookie: u64, delta: StatsDelta) -> KernelEvent {
    KernelEvent::Connection(ConnectionEvent {
        tuple,
        cookie,
        direction: Direction::Outgoing,
        kind,
        delta,
        timestamp_ns: 0,
    })
}

pub fn open(tuple: Tuple, cookie: u64) -> KernelEvent {
    conn(ConnEventKind::Open, tuple, cookie, StatsDelta::default())
}

pub fn update(tuple: Tuple, cookie: u64, sent: i64, recv: i64) -> KernelEvent {
    conn(ConnEventKind::Update, tuple, cookie, StatsDelta::bytes(sent, recv))
}

pub fn close(tuple: Tuple, cookie: u64) -> KernelEvent {
    conn(ConnEventKind::Close, tuple, cookie, StatsDelta::default())
}

pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut out = vec![(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags];
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Client preface, empty SETTINGS, then one HEADERS frame
pub fn http2_with_headers(block: &[u8]) -> Vec<u8> {
    let mut data = HTTP2_PREFACE.to_vec();
    data.extend(frame(0x04, 0, 0, &[]));
    data.extend(frame(0x01, 0x04, 1, block));
    data
}

/// HTTP/2 request whose HEADERS frame carries `content-type: application/grpc`
pub fn grpc_request() -> Vec<u8> {
    let mut block = vec![0x00, 0x0c];
    block.extend_from_slice(b"content-type");
    block.push(0x10);
    block.extend_from_slice(b"application/grpc");
    http2_with_headers(&block)
}

/// Plain HTTP/2 request using indexed static-table headers only
pub fn http2_request() -> Vec<u8> {
    http2_with_headers(&[0x82, 0x84, 0x86])
}
