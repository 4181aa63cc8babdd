use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use inkwell_ai::{augment_request, ArtifactRequest};
use inkwell_core::{Artifact, Issue, IssueCategory, Stage, Verdict};
use inkwell_infra::pipeline::{run_all, FanOutItem, QaSummary};
use inkwell_infra::UsageAccumulator;

fn bench_usage_recording_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("usage_recording_contention");

    for threads in [1usize, 4, 8].iter() {
        group.throughput(Throughput::Elements((*threads * 1000) as u64));
        group.bench_with_input(BenchmarkId::new("record_artifact", threads), threads, |b, &threads| {
            b.iter(|| {
                let usage = UsageAccumulator::start();
                std::thread::scope(|scope| {
                    for _ in 0..threads {
                        let usage = usage.clone();
                        scope.spawn(move || {
                            for i in 0..1000 {
                                usage.record_artifact("image-pro", i % 3 == 0);
                                usage.record_llm(120, 40, "judge");
                            }
                        });
                    }
                });
                black_box(usage.snapshot());
            });
        });
    }

    group.finish();
}

fn bench_stage_percentage(c: &mut Criterion) {
    c.bench_function("stage_percentage", |b| {
        b.iter(|| {
            for completed in 0..=12u32 {
                black_box(Stage::Illustrations.percentage(Some(black_box(completed)), Some(12)));
            }
        });
    });
}

fn bench_feedback_augmentation(c: &mut Criterion) {
    let original = ArtifactRequest::new("7", "the fox sails home under a full moon");
    let issues: Vec<Issue> = (0..12)
        .map(|i| {
            let category = match i % 4 {
                0 => IssueCategory::Text,
                1 => IssueCategory::Character,
                2 => IssueCategory::Composition,
                _ => IssueCategory::Style,
            };
            Issue::new(category, format!("issue {i}"))
        })
        .collect();

    c.bench_function("augment_and_render", |b| {
        b.iter(|| {
            let augmented = augment_request(black_box(&original), black_box(&issues));
            black_box(augmented.render_prompt());
        });
    });
}

fn finished_artifact(index: usize) -> Artifact {
    let mut artifact = Artifact::new(index, index.to_string(), 3);
    artifact.attempt = (index % 3) as u32 + 1;
    artifact.content_ref = Some(format!("{index}#1"));
    if index % 5 == 0 {
        artifact.verdict = Verdict::Fail;
        artifact.issues = vec![Issue::new(IssueCategory::Text, "lettering")];
    } else {
        artifact.verdict = Verdict::Pass;
        artifact.accepted = true;
    }
    artifact
}

fn bench_fanout_overhead(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout_overhead");
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .build()
        .unwrap();

    for items in [12usize, 48, 192].iter() {
        group.throughput(Throughput::Elements(*items as u64));
        group.bench_with_input(BenchmarkId::new("run_all", items), items, |b, &items| {
            b.iter(|| {
                let work: Vec<FanOutItem<()>> = (0..items)
                    .map(|index| FanOutItem {
                        index,
                        key: index.to_string(),
                        input: (),
                    })
                    .collect();
                let report = rt.block_on(run_all(work, |index, _| async move { finished_artifact(index) }, 6));
                black_box(report);
            });
        });
    }

    group.finish();
}

fn bench_qa_summary(c: &mut Criterion) {
    let artifacts: Vec<Artifact> = (0..1000).map(finished_artifact).collect();
    c.bench_function("qa_summary_1000", |b| {
        b.iter(|| black_box(QaSummary::from_artifacts(black_box(&artifacts))));
    });
}

criterion_group!(
    benches,
    bench_usage_recording_contention,
    bench_stage_percentage,
    bench_feedback_augmentation,
    bench_fanout_overhead,
    bench_qa_summary
);
criterion_main!(benches);
