//! Performance benchmarks for topicrpc
//!
//! Topic matching and envelope coding sit on every delivery; the round
//! trip measures a full correlated call over the in-memory broker.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use topicrpc::message::{self, Codec};
use topicrpc::{
    topic, Bus, BusConfig, Client, MemoryBroker, MemoryTransport, MethodTable, Server, Service,
};

#[derive(Serialize, Deserialize, Clone)]
struct BenchmarkData {
    data: Vec<u8>,
    sequence: u64,
}

impl BenchmarkData {
    fn new(size: usize, sequence: u64) -> Self {
        Self {
            data: vec![0u8; size],
            sequence,
        }
    }
}

struct Echo;

impl Service for Echo {
    fn describe(table: &mut MethodTable<Self>) {
        table.method("echo", |_: Arc<Self>, data: BenchmarkData| async move { Ok(data) });
    }
}

/// Test wildcard and route matching
fn benchmark_topic_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_matching");
    let topic_name = "$device/ABCDE/channel/xyz/on-off/event/state";

    for pattern in ["$device/+/channel/+/on-off/event/+", "$device/#", "#"] {
        group.bench_with_input(BenchmarkId::new("matches", pattern), pattern, |b, pattern| {
            b.iter(|| black_box(topic::matches(black_box(pattern), black_box(topic_name))));
        });
    }

    group.bench_function("match_route", |b| {
        b.iter(|| {
            black_box(topic::match_route(
                black_box("$device/:guid/channel/:cid/on-off/event/:name"),
                black_box(topic_name),
            ))
        });
    });

    group.finish();
}

/// Test envelope encoding and decoding
fn benchmark_codec(c: &mut Criterion) {
    let codec = Codec::default();
    let mut group = c.benchmark_group("codec");

    for size in [64, 256, 1024, 4096].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        group.bench_with_input(BenchmarkId::new("request_round_trip", size), size, |b, &size| {
            let params = serde_json::to_value(BenchmarkData::new(size, 0)).unwrap();
            b.iter(|| {
                let encoded = codec.encode_request("echo", Some(&params), Some(7)).unwrap();
                black_box(message::decode_request(&encoded).unwrap());
            });
        });
    }

    group.bench_function("response_peek", |b| {
        let response = codec.response(Some(7), Ok(serde_json::json!({"on": true})));
        let encoded = codec.encode_response(&response).unwrap();
        b.iter(|| black_box(message::ResponseHead::peek(&encoded).unwrap()));
    });

    group.finish();
}

/// Test a full correlated call
fn benchmark_call_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let (client, _server) = rt.block_on(async {
        let transport = Arc::new(MemoryTransport::new(Arc::new(MemoryBroker::new())));
        let server_bus = Bus::connect(
            transport.clone(),
            BusConfig::builder("memory://bench")
                .with_client_id("bench-server")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
        let server = Server::new(server_bus);
        server.register_service(Arc::new(Echo), "bench/echo").await.unwrap();

        let client_bus = Bus::connect(
            transport,
            BusConfig::builder("memory://bench")
                .with_client_id("bench-client")
                .build()
                .unwrap(),
        )
        .await
        .unwrap();
        (Client::new(client_bus), server)
    });

    let client = &client;
    let mut group = c.benchmark_group("call_round_trip");
    group.bench_function("memory_broker_64b", |b| {
        b.to_async(&rt).iter(|| async move {
            let reply: BenchmarkData = client
                .call_with_timeout(
                    "bench/echo",
                    "echo",
                    &BenchmarkData::new(64, 1),
                    Duration::from_secs(1),
                )
                .await
                .unwrap();
            black_box(reply.sequence);
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    benchmark_topic_matching,
    benchmark_codec,
    benchmark_call_round_trip
);
criterion_main!(benches);
