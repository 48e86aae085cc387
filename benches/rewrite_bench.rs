use std::sync::Arc;

use async_trait::async_trait;
use caql_convert::{
    find_metric_references, map_aggregation, plan_rewrite, AggregationConfig, AggregationRewriter,
    MetricDescriptor, ResolvedType, TagIndex, TagLookupError, TagResolver,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Every lookup answers with one tagged series
#[derive(Debug)]
struct FixedTagIndex;

#[async_trait]
impl TagIndex for FixedTagIndex {
    async fn find_matching_metrics(&self, pattern: &str) -> Result<Vec<MetricDescriptor>, TagLookupError> {
        Ok(vec![MetricDescriptor::new(format!("{}|ST[statsd_type:upper_90]", pattern))])
    }
}

fn build_query(references: usize) -> String {
    (0..references)
        .map(|i| format!("graphite:find('svc{}.http.latency.upper_90')", i))
        .collect::<Vec<_>>()
        .join(" + ")
}

fn aggregations() -> AggregationConfig {
    AggregationConfig::new(
        ["upper_90", "count", "sum", "mean"].iter().map(|k| k.to_string()).collect(),
        60,
        10,
    )
}

fn bench_mapper(c: &mut Criterion) {
    let mut group = c.benchmark_group("map_aggregation");

    for keyword in ["count", "upper_99", "mean_250", "not_a_keyword"] {
        group.bench_with_input(BenchmarkId::from_parameter(keyword), keyword, |b, keyword| {
            b.iter(|| black_box(map_aggregation(black_box(keyword), 60)))
        });
    }

    group.finish();
}

fn bench_scan_and_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("scan_and_plan");
    let config = aggregations();

    for size in [1, 8, 64].iter() {
        let query = build_query(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let matches = find_metric_references(black_box(&query));
                for m in &matches {
                    black_box(plan_rewrite(m, &ResolvedType::Unknown, &config));
                }
            })
        });
    }

    group.finish();
}

fn bench_rewrite(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rewriter = AggregationRewriter::new(TagResolver::with_index(Arc::new(FixedTagIndex)), aggregations());

    let mut group = c.benchmark_group("rewrite");

    for size in [1, 8, 64].iter() {
        let query = build_query(*size);

        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| rt.block_on(async { black_box(rewriter.rewrite(&query).await) }))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mapper, bench_scan_and_plan, bench_rewrite);
criterion_main!(benches);
