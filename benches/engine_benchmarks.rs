//! Benchmarks for the experiment engine hot paths
//!
//! - Hash bucketing and cumulative-share selection
//! - Get-or-create assignment (new and existing users)
//! - Metric recording with comparison recomputation
//! - Report generation over a populated experiment

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

use gamify_experiments::experiment::assignment::pick_by_cumulative_share;
use gamify_experiments::experiment::types::{MetricDefinition, MetricKind, VariantDefinition};
use gamify_experiments::experiment::{
    user_hash_bucket, AllocationStrategy, Experiment, ExperimentDefinition, ExperimentEngine,
    SeededRandom, StaticUserDirectory, Targeting,
};
use gamify_experiments::storage::InMemoryStore;

/// Helper: engine over a fresh in-memory store with one ACTIVE experiment
fn setup_engine(variants: usize, targeting: Targeting) -> (ExperimentEngine, Experiment) {
    let engine = ExperimentEngine::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(StaticUserDirectory::new()),
    )
    .with_random(Arc::new(SeededRandom::new(7)));

    let share = 100.0 / variants as f64;
    let mut builder = ExperimentDefinition::builder("bench").with_targeting(targeting);
    for i in 0..variants {
        builder = builder.with_variant(VariantDefinition::new(&format!("variant_{i}"), share));
    }
    let definition = builder
        .with_metric(MetricDefinition::new("completion", MetricKind::Conversion))
        .with_metric(MetricDefinition::new("minutes", MetricKind::Engagement))
        .build();

    let experiment = engine
        .create_experiment(definition)
        .expect("Failed to create experiment");
    let experiment = engine
        .start_experiment(&experiment.id)
        .expect("Failed to start experiment");
    (engine, experiment)
}

fn bench_hashing(c: &mut Criterion) {
    let (_, experiment) = setup_engine(4, Targeting::default());

    c.bench_function("user_hash_bucket", |b| {
        b.iter(|| user_hash_bucket(black_box("learner-8d1f0c2e@example.com")))
    });

    c.bench_function("pick_by_cumulative_share", |b| {
        b.iter(|| pick_by_cumulative_share(black_box(&experiment.variants), black_box(63.0)))
    });
}

fn bench_assignment(c: &mut Criterion) {
    let mut group = c.benchmark_group("assign_variant");

    for (name, targeting) in [
        ("weighted_random", Targeting::default()),
        (
            "hash",
            Targeting::default().with_allocation(AllocationStrategy::Hash),
        ),
    ] {
        let (engine, experiment) = setup_engine(2, targeting);
        let mut next_user = 0u64;

        group.bench_with_input(BenchmarkId::new("new_user", name), &name, |b, _| {
            b.iter(|| {
                next_user += 1;
                engine
                    .assign_variant(&format!("user-{next_user}"), &experiment.id)
                    .expect("assign")
            })
        });

        engine
            .assign_variant("returning", &experiment.id)
            .expect("assign");
        group.bench_with_input(BenchmarkId::new("existing_user", name), &name, |b, _| {
            b.iter(|| {
                engine
                    .assign_variant(black_box("returning"), &experiment.id)
                    .expect("assign")
            })
        });
    }

    group.finish();
}

fn bench_record_metric(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_metric");

    for variants in [2usize, 5] {
        group.bench_with_input(
            BenchmarkId::from_parameter(variants),
            &variants,
            |b, &variants| {
                b.iter_batched(
                    || setup_engine(variants, Targeting::default()),
                    |(engine, experiment)| {
                        for (i, variant) in experiment.variants.iter().enumerate() {
                            for j in 0..10 {
                                engine
                                    .record_metric(
                                        &experiment.id,
                                        &variant.id,
                                        &experiment.metrics[0].id,
                                        ((i + j) % 2) as f64,
                                    )
                                    .expect("record");
                            }
                        }
                    },
                    BatchSize::SmallInput,
                )
            },
        );
    }

    group.finish();
}

fn bench_report(c: &mut Criterion) {
    let (engine, experiment) = setup_engine(3, Targeting::default());
    for (i, variant) in experiment.variants.iter().enumerate() {
        for j in 0..200 {
            let completion = if j % (i + 2) == 0 { 1.0 } else { 0.0 };
            engine
                .record_metric(&experiment.id, &variant.id, &experiment.metrics[0].id, completion)
                .expect("record");
            engine
                .record_metric(
                    &experiment.id,
                    &variant.id,
                    &experiment.metrics[1].id,
                    (j % 30) as f64,
                )
                .expect("record");
        }
    }
    for u in 0..1_000 {
        engine
            .assign_variant(&format!("user-{u}"), &experiment.id)
            .expect("assign");
    }

    c.bench_function("get_report", |b| {
        b.iter(|| engine.get_report(black_box(&experiment.id)).expect("report"))
    });
}

criterion_group!(
    benches,
    bench_hashing,
    bench_assignment,
    bench_record_metric,
    bench_report
);
criterion_main!(benches);
