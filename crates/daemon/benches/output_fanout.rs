//! Benchmarks for the terminal output hot path.
//!
//! - Fan-out of one output chunk to every client in a room
//! - Encoding of output events in both wire formats

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use daemon::session::{OutputRouter, OutputSink};
use labterm_protocol::{encode, ServerEvent, SessionOutput, WireFormat};

fn bench_room_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("room_fanout");
    let chunk = Bytes::from(vec![b'x'; 1024]);

    for clients in [1usize, 8, 64] {
        let router = OutputRouter::new(256);
        let mut receivers: Vec<_> = (0..clients)
            .map(|i| {
                let id = format!("client-{}", i);
                let rx = router.register_client(&id);
                router.join_room(&id, "lab");
                rx
            })
            .collect();
        router.bind_bridge("bridge-1", "lab", "attacker");

        group.throughput(Throughput::Bytes((chunk.len() * clients) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(clients), &clients, |b, _| {
            b.iter(|| {
                router.emit("bridge-1", black_box(chunk.clone()));
                for rx in receivers.iter_mut() {
                    while let Ok(event) = rx.try_recv() {
                        black_box(event);
                    }
                }
            });
        });
    }

    group.finish();
}

fn bench_output_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_encoding");

    for size in [64usize, 1024, 4096] {
        let event = ServerEvent::SessionOutput(SessionOutput {
            bridge_id: "s1_1700000000000_0".to_string(),
            role: "attacker".to_string(),
            data: Bytes::from(vec![b'a'; size]),
        });
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("json", size), &event, |b, event| {
            b.iter(|| encode(black_box(event), WireFormat::Json))
        });
        group.bench_with_input(BenchmarkId::new("msgpack", size), &event, |b, event| {
            b.iter(|| encode(black_box(event), WireFormat::MessagePack))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_room_fanout, bench_output_encoding);
criterion_main!(benches);
