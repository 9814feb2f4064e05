use criterion::{black_box, criterion_group, criterion_main, Criterion};
use farsight::trie::active::ActiveNodeSet;
use farsight::trie::leaf_iter::LeafIterator;
use farsight::trie::node::Trie;

fn dictionary_trie(words: usize) -> Trie {
    let mut trie = Trie::new();
    // Deterministic pseudo-words over a small alphabet.
    let alphabet = b"etaoinshr";
    for i in 0..words {
        let mut word = String::new();
        let mut value = i * 2654435761 % (1 << 31);
        for _ in 0..(4 + i % 6) {
            word.push(alphabet[value % alphabet.len()] as char);
            value = value / alphabet.len() + 17;
        }
        trie.insert_keyword(&word, (i % 100) as f32);
    }
    trie
}

fn bench_active_nodes(c: &mut Criterion) {
    let trie = dictionary_trie(20_000);

    c.bench_function("compute_active_nodes_ed2", |b| {
        b.iter(|| {
            let set = ActiveNodeSet::compute(&trie, black_box("etaons"), 2);
            black_box(set.len())
        })
    });

    c.bench_function("incremental_extension", |b| {
        let base = ActiveNodeSet::compute(&trie, "etaon", 2);
        b.iter(|| {
            let extended = base.extend(&trie, black_box('s'));
            black_box(extended.len())
        })
    });

    c.bench_function("leaf_iteration_prefix", |b| {
        let set = ActiveNodeSet::compute(&trie, "eta", 1);
        b.iter(|| {
            let iter = LeafIterator::for_prefix(&trie, &set, 1);
            black_box(iter.len())
        })
    });
}

criterion_group!(benches, bench_active_nodes);
criterion_main!(benches);
