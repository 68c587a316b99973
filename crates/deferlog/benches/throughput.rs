use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use deferlog::{Config, Log, TemplateFormatter, WriteError, Writer};
use std::hint::black_box;

/// Discards everything; isolates the cost of the logging pipeline itself.
struct NullWriter;

impl Writer for NullWriter {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, WriteError> {
        Ok(bytes.len())
    }
}

fn bench_write_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("write");
    group.throughput(Throughput::Elements(1));

    {
        let log = Log::open(Box::new(NullWriter)).unwrap();
        group.bench_function("int", |b| {
            let mut i = 0u64;
            b.iter(|| {
                log.write::<TemplateFormatter, _>(("%d\n", (black_box(i),)))
                    .unwrap();
                i = i.wrapping_add(1);
            });
        });
        log.close().unwrap();
    }

    {
        let log = Log::open(Box::new(NullWriter)).unwrap();
        group.bench_function("mixed", |b| {
            let mut i = 0u64;
            b.iter(|| {
                log.write::<TemplateFormatter, _>((
                    "%s %d %.3f\n",
                    ("event", black_box(i), black_box(i as f64) * 0.25),
                ))
                .unwrap();
                i = i.wrapping_add(1);
            });
        });
        log.close().unwrap();
    }

    {
        // Small ring keeps the wraparound path hot.
        let config = Config::new(4096, 64 * 1024, 128);
        let log = Log::with_config(Box::new(NullWriter), config).unwrap();
        group.bench_function("int_small_ring", |b| {
            let mut i = 0u64;
            b.iter(|| {
                log.write::<TemplateFormatter, _>(("%d\n", (black_box(i),)))
                    .unwrap();
                i = i.wrapping_add(1);
            });
        });
        log.close().unwrap();
    }

    group.finish();
}

criterion_group!(benches, bench_write_path);
criterion_main!(benches);
