//! Benchmarks for response reconciliation and configuration parsing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use target_link::codec::queue::{normalize_step, CommandResponseQueue};
use target_link::codec::usb2any::crc8;
use target_link::registry::grammar::{identifiers, parse_configuration};

fn bench_in_order_responses(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_order_responses");

    for depth in [1usize, 8, 30].iter() {
        group.throughput(Throughput::Elements(*depth as u64));
        group.bench_with_input(BenchmarkId::new("fill_and_drain", depth), depth, |b, &depth| {
            let queue = CommandResponseQueue::new("bench");
            b.iter(|| {
                let receivers: Vec<_> = (0..depth)
                    .map(|i| queue.add_command(7, (i % 255) as u8))
                    .collect();
                for i in 0..depth {
                    queue.add_response(vec![0u8; 4], 7, Some((i % 255) as u8));
                }
                black_box(receivers)
            });
        });
    }

    group.finish();
}

fn bench_lost_responses(c: &mut Criterion) {
    let mut group = c.benchmark_group("lost_responses");

    // Every other response goes missing and is rejected on the next one
    group.bench_function("skip_every_other", |b| {
        let queue = CommandResponseQueue::new("bench");
        b.iter(|| {
            let receivers: Vec<_> = (0..30u8).map(|seq| queue.add_command(7, seq)).collect();
            for seq in (1..30u8).step_by(2) {
                queue.add_response(Vec::new(), 7, Some(seq));
            }
            queue.clear_all();
            black_box(receivers)
        });
    });

    group.bench_function("normalize_step", |b| {
        b.iter(|| {
            for step in -254..=254 {
                black_box(normalize_step(black_box(step)));
            }
        });
    });

    group.finish();
}

fn bench_configuration_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("configuration_parsing");

    let configurations = [
        ("single", "usb"),
        ("chain", "usb+u2a+json"),
        ("tree", "usb+u2a(power,gpio,adc,i2c)"),
        ("multi", "usb+u2a(power,gpio),xds+dslite(cc),pm+json(msp(sensor))"),
    ];
    for (name, configuration) in configurations {
        group.bench_with_input(BenchmarkId::new("parse", name), configuration, |b, cfg| {
            b.iter(|| black_box(parse_configuration(black_box(cfg))));
        });
        group.bench_with_input(BenchmarkId::new("identifiers", name), configuration, |b, cfg| {
            b.iter(|| black_box(identifiers(black_box(cfg))));
        });
    }

    group.finish();
}

fn bench_packet_checksum(c: &mut Criterion) {
    let packet: Vec<u8> = (0..62u8).collect();
    c.bench_function("crc8_full_packet", |b| {
        b.iter(|| black_box(crc8(black_box(&packet))));
    });
}

criterion_group!(
    benches,
    bench_in_order_responses,
    bench_lost_responses,
    bench_configuration_parsing,
    bench_packet_checksum,
);

criterion_main!(benches);
