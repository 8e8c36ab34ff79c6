//! 누락 보고 인코딩/반영 벤치마크
//!
//! 최대 조각 수(65535)에서 전체 보고 생성과 반영 비용 측정

use std::collections::BTreeSet;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dtl::{apply_update, encode_missing_set, FragmentIndex};

/// 손실률에 따른 누락 집합
fn missing_set(num_packets: u16, loss: f64) -> BTreeSet<FragmentIndex> {
    let mut rng = StdRng::seed_from_u64(42);
    (0..num_packets).filter(|_| rng.gen_bool(loss)).collect()
}

fn bench_encode_missing_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode-missing-set");

    for num_packets in [256u16, 4096, u16::MAX] {
        let missing = missing_set(num_packets, 0.1);
        group.throughput(Throughput::Elements(num_packets as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_packets),
            &missing,
            |b, missing| b.iter(|| black_box(encode_missing_set(missing, num_packets))),
        );
    }

    group.finish();
}

fn bench_apply_report(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply-report");

    for num_packets in [256u16, 4096, u16::MAX] {
        let report = encode_missing_set(&missing_set(num_packets, 0.1), num_packets);
        let full: BTreeSet<FragmentIndex> = (0..num_packets).collect();

        group.throughput(Throughput::Elements(num_packets as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_packets),
            &report,
            |b, report| {
                b.iter(|| {
                    let mut missing = full.clone();
                    for window in report {
                        apply_update(
                            &mut missing,
                            window.seq_offset,
                            window.msb,
                            window.lsb,
                            num_packets,
                        )
                        .unwrap();
                    }
                    black_box(missing.len())
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_encode_missing_set, bench_apply_report);
criterion_main!(benches);
