//! Meta pack/unpack micro-benchmark.
//!
//! The packed metadata record is built and parsed once per message on both
//! sides, so its cost sits directly on the message path.
//!
//! Run with:
//! ```bash
//! cargo bench --package rdmavan --bench encoding
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use rdmavan::encoding::{pack_meta, packed_meta_len, unpack_meta};
use rdmavan::message::{Command, Control, Meta, Node, Role};

fn push_request_meta() -> Meta {
    let mut meta = Meta {
        sender: 9,
        recver: 8,
        timestamp: 1234,
        customer_id: 0,
        request: true,
        push: true,
        key: 7,
        addr: 0x7f43_1200_0000,
        val_len: 1 << 20,
        option: 0xdead_beef,
        ..Meta::default()
    };
    meta.data_num = 3;
    meta.data_len = [8, 1 << 20, 4, 0];
    meta
}

fn control_meta() -> Meta {
    Meta {
        sender: 1,
        control: Control {
            cmd: Command::AddNode,
            barrier_group: 7,
            msg_sig: 42,
            nodes: (0..8)
                .map(|i| Node {
                    id: i,
                    role: if i % 2 == 0 { Role::Worker } else { Role::Server },
                    hostname: format!("10.0.0.{}", i),
                    port: 9000 + i as u16,
                })
                .collect(),
        },
        ..Meta::default()
    }
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("meta");

    for (name, meta) in [("push_request", push_request_meta()), ("control", control_meta())] {
        let len = packed_meta_len(&meta);
        let mut buf = vec![0u8; len];
        group.throughput(Throughput::Bytes(len as u64));

        group.bench_function(format!("pack/{}", name), |b| {
            b.iter(|| pack_meta(black_box(&meta), black_box(&mut buf)))
        });

        pack_meta(&meta, &mut buf);
        group.bench_function(format!("unpack/{}", name), |b| {
            b.iter(|| unpack_meta(black_box(&buf)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encoding);
criterion_main!(benches);
