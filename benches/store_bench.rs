use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rememory::{ContainerStore, SharedCell, SharedList, SharedMap, StoreConfig};

fn bench_name(tag: &str) -> String {
    format!("bench_{}_{}", tag, std::process::id())
}

fn benchmark_cell_increment(c: &mut Criterion) {
    let store = ContainerStore::default();
    let counter = SharedCell::open(&store, &bench_name("counter"), 0u64).unwrap();

    c.bench_function("cell_increment", |b| {
        b.iter(|| counter.increment(black_box(1)).unwrap());
    });

    counter.destroy().unwrap();
}

fn benchmark_map_insert_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("Map");

    for entries in [16usize, 256, 4096].iter() {
        let store = ContainerStore::default();
        let map: SharedMap<i64, i64> =
            SharedMap::open_with(&store, &bench_name("map"), (0..*entries as i64).map(|i| (i, i)))
                .unwrap();

        group.bench_with_input(BenchmarkId::new("insert", entries), entries, |b, _| {
            b.iter(|| map.insert(black_box(1), black_box(2)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("get", entries), entries, |b, _| {
            b.iter(|| map.get(black_box(1)).unwrap());
        });

        map.destroy().unwrap();
    }

    group.finish();
}

fn benchmark_append_with_growth(c: &mut Criterion) {
    let mut group = c.benchmark_group("Sequence");
    let count = 512i64;
    group.throughput(Throughput::Elements(count as u64));

    group.bench_function("append_from_minimum_capacity", |b| {
        let store = ContainerStore::new(StoreConfig::default().with_initial_capacity(64));
        b.iter(|| {
            let list: SharedList<i64> = SharedList::open(&store, &bench_name("append")).unwrap();
            for i in 0..count {
                list.push(i).unwrap();
            }
            list.destroy().unwrap();
        });
    });

    group.finish();
}

fn benchmark_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("Snapshot");

    for len in [100i64, 10_000].iter() {
        let store = ContainerStore::default();
        let list: SharedList<i64> =
            SharedList::open_with(&store, &bench_name("snapshot"), 0..*len).unwrap();

        group.throughput(Throughput::Elements(*len as u64));
        group.bench_with_input(BenchmarkId::new("to_vec", len), len, |b, _| {
            b.iter(|| black_box(list.to_vec().unwrap()));
        });

        list.destroy().unwrap();
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_cell_increment,
    benchmark_map_insert_get,
    benchmark_append_with_growth,
    benchmark_snapshot
);
criterion_main!(benches);
