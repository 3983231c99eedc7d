use std::hint::black_box;
use std::sync::Arc;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use sockroute::path::PathPattern;
use sockroute::protocol::{decode_envelope, encode_envelope, Body, ClientFrame, Method, ServerFrame, WireFormat};
use sockroute::registry::{Connection, GroupStore};

fn request_frame() -> ClientFrame {
    ClientFrame::new(Method::Post, "/rooms/lobby/messages?since=42")
        .with_request_id(1234)
        .with_body(Body::binary(vec![7u8; 64]))
}

fn push_frame() -> ServerFrame {
    ServerFrame::new(Method::Post, "/rooms/lobby/messages", 200).with_body(Body::text("x".repeat(64)))
}

fn bench_binary_encode(c: &mut Criterion) {
    let frame = request_frame();
    c.bench_function("binary_encode_client_64B", |b| {
        b.iter(|| black_box(WireFormat::Binary.encode_client(black_box(&frame)).unwrap()))
    });
}

fn bench_binary_decode(c: &mut Criterion) {
    let encoded = WireFormat::Binary.encode_client(&request_frame()).unwrap();
    c.bench_function("binary_decode_client_64B", |b| {
        b.iter(|| black_box(WireFormat::Binary.decode_client(black_box(&encoded)).unwrap()))
    });
}

fn bench_json_encode(c: &mut Criterion) {
    let frame = push_frame();
    c.bench_function("json_encode_server_64B", |b| {
        b.iter(|| black_box(WireFormat::Json.encode_server(black_box(&frame)).unwrap()))
    });
}

fn bench_json_decode(c: &mut Criterion) {
    let encoded = WireFormat::Json.encode_server(&push_frame()).unwrap();
    c.bench_function("json_decode_server_64B", |b| {
        b.iter(|| black_box(WireFormat::Json.decode_server(black_box(&encoded)).unwrap()))
    });
}

fn bench_envelope(c: &mut Criterion) {
    let frame = WireFormat::Binary.encode_server(&push_frame()).unwrap();
    let envelope = encode_envelope("0f8e4c2a9b7d41e6a3c5d2b1e0f9a8c7", &frame).unwrap();
    c.bench_function("envelope_encode", |b| {
        b.iter(|| black_box(encode_envelope(black_box("0f8e4c2a9b7d41e6a3c5d2b1e0f9a8c7"), &frame).unwrap()))
    });
    c.bench_function("envelope_decode", |b| {
        b.iter(|| black_box(decode_envelope(black_box(&envelope)).unwrap()))
    });
}

fn bench_path_match(c: &mut Criterion) {
    let pattern = PathPattern::parse("/rooms/:room/messages/:id?");
    let wildcard = PathPattern::parse("/files/:path+");
    c.bench_function("path_match_params", |b| {
        b.iter(|| black_box(pattern.matches(black_box("/rooms/lobby/messages/17?x=1"))))
    });
    c.bench_function("path_match_repeat", |b| {
        b.iter(|| black_box(wildcard.matches(black_box("/files/a/b/c/d/e.txt"))))
    });
}

fn bench_group_fanout(c: &mut Criterion) {
    let groups = GroupStore::new();
    let mut receivers = Vec::new();
    for i in 0..100 {
        let (conn, rx) = Connection::detached(format!("c{i}"));
        groups.add("lobby", conn);
        receivers.push(rx);
    }
    let frame: Bytes = WireFormat::Binary.encode_server(&push_frame()).unwrap();

    c.bench_function("group_fanout_100_members", |b| {
        b.iter(|| {
            for member in groups.find("lobby") {
                member.send(frame.clone());
            }
            for rx in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_group_membership(c: &mut Criterion) {
    c.bench_function("group_join_leave_1000", |b| {
        b.iter(|| {
            let groups = GroupStore::new();
            let conns: Vec<Arc<Connection>> = (0..1000)
                .map(|i| Connection::detached(format!("c{i}")).0)
                .collect();
            for (i, conn) in conns.iter().enumerate() {
                groups.add(&format!("g{}", i % 10), conn.clone());
            }
            for conn in &conns {
                black_box(groups.remove_connection(conn.id()));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_binary_encode,
    bench_binary_decode,
    bench_json_encode,
    bench_json_decode,
    bench_envelope,
    bench_path_match,
    bench_group_fanout,
    bench_group_membership,
);
criterion_main!(benches);
