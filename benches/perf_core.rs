use criterion::{black_box, criterion_group, criterion_main, Criterion};
use nightmend::diff::{apply_file_patch, PatchSet};
use nightmend::failure;
use nightmend::learning::LearningStore;

fn synthetic_pytest_output(failures: usize) -> String {
    let mut out = String::with_capacity(failures * 120);
    out.push_str("============================= test session starts ==============================\n");
    for i in 0..failures {
        out.push_str(&format!("tests/test_mod_{:03}.py::test_case_{} PASSED\n", i % 50, i));
    }
    out.push_str("=========================== short test summary info ============================\n");
    for i in 0..failures {
        out.push_str(&format!(
            "FAILED tests/test_mod_{:03}.py::test_case_{} - AssertionError: assert {} != {}\n",
            i % 50,
            i,
            i,
            i + 1
        ));
    }
    out.push_str(&format!("==== {} failed, {} passed in 1.23s ====\n", failures, failures));
    out
}

fn bench_parse_failures(c: &mut Criterion) {
    let output = synthetic_pytest_output(2_000);
    c.bench_function("parse_pytest_output_2k", |b| {
        b.iter(|| {
            let records = failure::parse(black_box(&output));
            black_box(records.len());
        });
    });
}

fn bench_apply_diff(c: &mut Criterion) {
    let original: String = (0..5_000).map(|i| format!("line_{i} = {i}\n")).collect();
    let mut diff = String::from("--- a/big.py\n+++ b/big.py\n");
    for i in (100..4_900).step_by(400) {
        diff.push_str(&format!(
            "@@ -{start},3 +{start},3 @@\n line_{a} = {a}\n-line_{b} = {b}\n+line_{b} = {b} + 1\n line_{c} = {c}\n",
            start = i + 1,
            a = i,
            b = i + 1,
            c = i + 2
        ));
    }
    let set = PatchSet::parse(&diff).expect("synthetic diff should parse");

    c.bench_function("apply_file_patch_5k_lines", |b| {
        b.iter(|| {
            let patched = apply_file_patch(black_box(&original), &set.files[0]).expect("apply");
            black_box(patched.len());
        });
    });
}

fn bench_learning_lookup(c: &mut Criterion) {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut store = LearningStore::empty(temp.path().join("learned.json"));
    for i in 0..500 {
        store
            .store(format!("ValueError: bad value {i}"), "AI patch applied")
            .expect("store");
    }

    c.bench_function("learning_lookup_miss_500", |b| {
        b.iter(|| black_box(store.lookup(black_box("KeyError: 'missing'")).is_none()));
    });
}

criterion_group!(perf_core, bench_parse_failures, bench_apply_diff, bench_learning_lookup);
criterion_main!(perf_core);
