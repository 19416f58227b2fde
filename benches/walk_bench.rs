use bfs::{Strategy, Traversal, Visit};
use criterion::{Criterion, criterion_group, criterion_main};
use std::fs;
use std::hint::black_box;
use std::path::PathBuf;

/// A moderately bushy fixture: 8 directories of 8 subdirectories, each
/// holding 16 files. Built once and reused across samples.
fn build_tree() -> PathBuf {
    let root = std::env::temp_dir().join(format!("bfs_bench_{}", std::process::id()));
    let _ = fs::remove_dir_all(&root);
    for outer in 0..8 {
        for inner in 0..8 {
            let dir = root.join(format!("d{outer}")).join(format!("s{inner}"));
            fs::create_dir_all(&dir).expect("bench tree");
            for file in 0..16 {
                fs::write(dir.join(format!("f{file}")), "").expect("bench tree");
            }
        }
    }
    root
}

fn walk(root: &PathBuf, strategy: Strategy, threads: usize) -> u64 {
    let traversal = Traversal::init([root])
        .strategy(strategy)
        .threads(Some(threads))
        .build()
        .expect("traversal config");
    let mut count = 0u64;
    traversal
        .run(|entry| {
            black_box(entry.depth());
            count += 1;
            Visit::Continue
        })
        .expect("traversal run");
    count
}

fn bench_strategies(c: &mut Criterion) {
    let root = build_tree();
    let expected: u64 = 1 + 8 + 64 + 64 * 16;

    let mut group = c.benchmark_group("walk");
    for threads in [1usize, 4] {
        group.bench_function(format!("bfs_{threads}_threads"), |b| {
            b.iter(|| {
                let count = walk(&root, Strategy::Bfs, threads);
                assert_eq!(count, expected);
                black_box(count)
            });
        });
        group.bench_function(format!("dfs_{threads}_threads"), |b| {
            b.iter(|| {
                let count = walk(&root, Strategy::Dfs, threads);
                assert_eq!(count, expected);
                black_box(count)
            });
        });
    }
    group.finish();

    let _ = fs::remove_dir_all(&root);
}

criterion_group!(benches, bench_strategies);
criterion_main!(benches);
