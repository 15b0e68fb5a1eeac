//! Accumulation throughput: merge vs composite.
//!
//! Models the decoder hot path: fold a stream of fragment buffers into one
//! accumulator, consuming frames as they complete.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use strand_buf::{BufAllocator, Cumulation, Cumulator, HeapAllocator};

const FRAGMENT: usize = 256;
const FRAGMENTS: usize = 64;

fn accumulate(cumulator: Cumulator, alloc: &HeapAllocator) {
    let mut cum: Option<Cumulation> = None;
    for _ in 0..FRAGMENTS {
        let mut incoming = alloc.allocate(FRAGMENT, FRAGMENT);
        incoming.write_bytes(&[0x2a; FRAGMENT]).unwrap();
        cum = Some(match cum.take() {
            None => Cumulation::Plain(incoming),
            Some(current) => cumulator.cumulate(alloc, current, incoming).unwrap(),
        });
    }
    cum.unwrap().release().unwrap();
}

fn bench_cumulate(c: &mut Criterion) {
    let alloc = HeapAllocator::unsampled();
    let mut group = c.benchmark_group("cumulate");
    group.throughput(Throughput::Bytes((FRAGMENT * FRAGMENTS) as u64));

    for (name, cumulator) in [
        ("merge", Cumulator::Merge),
        ("composite", Cumulator::Composite),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &cumulator, |b, &cm| {
            b.iter(|| accumulate(cm, &alloc));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_cumulate);
criterion_main!(benches);
