// SPDX-License-Identifier: MIT OR Apache-2.0
use cozy_path::{canonicalize, check, id, DocType, Platform};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_canonicalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("canonicalize");
    let cases = [
        ("flat", "report.txt"),
        ("nested", "a/b/c/d/e/f/report.txt"),
        (
            "native_windows_style",
            r"a\b\c\..\d\.\e\report.txt",
        ),
    ];

    for (name, path) in cases {
        group.bench_with_input(BenchmarkId::from_parameter(name), &path, |b, path| {
            b.iter(|| canonicalize(black_box(path)));
        });
    }
    group.finish();
}

fn bench_id(c: &mut Criterion) {
    let mut group = c.benchmark_group("id");
    let path = "docs/reports/Q3-Summary.txt";
    for platform in [Platform::Linux, Platform::MacOs, Platform::Windows] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{platform:?}")),
            &platform,
            |b, &platform| {
                b.iter(|| id(black_box(path), platform));
            },
        );
    }
    group.finish();
}

fn bench_check(c: &mut Criterion) {
    let mut group = c.benchmark_group("check");
    let path = "docs/reports/Quarterly Report: Final.txt";
    for platform in [Platform::Linux, Platform::MacOs, Platform::Windows] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{platform:?}")),
            &platform,
            |b, &platform| {
                b.iter(|| check(black_box(path), DocType::File, platform));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_canonicalize, bench_id, bench_check);
criterion_main!(benches);
