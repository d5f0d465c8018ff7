//! 정책 신호 계산 벤치마크
//!
//! Local signal computations run once per successful scrape; they should stay
//! negligible next to the fetch itself.

use chrono::Utc;
use criterion::{Criterion, black_box, criterion_group, criterion_main};

use pulse_scraper_lib::application::content_metrics;
use pulse_scraper_lib::application::policy::{change_boost, cost_factor, error_penalty};
use pulse_scraper_lib::domain::entities::{ContentMetrics, ScrapingStatus, Snapshot};
use pulse_scraper_lib::domain::retry_state::backoff_seconds;

fn history(len: usize) -> Vec<Snapshot> {
    (0..len)
        .map(|i| Snapshot {
            id: i as i64,
            entity_id: "bench".to_string(),
            status: if i % 3 == 0 {
                ScrapingStatus::Failed
            } else {
                ScrapingStatus::Success
            },
            version: (len - i) as u32,
            http_status: Some(200),
            metrics: ContentMetrics {
                content_length: 20_000 + i as u64 * 100,
                link_count: 40,
                media_count: 8,
                structured_data_count: 2,
                content_change_percentage: Some((i * 7 % 100) as f64),
            },
            fetch_duration_ms: 850,
            cost: 0.002,
            error: None,
            content_hash: None,
            markdown: None,
            created_at: Utc::now(),
        })
        .collect()
}

fn bench_signals(c: &mut Criterion) {
    let snapshots = history(5);

    c.bench_function("policy_signals_window_5", |b| {
        b.iter(|| {
            let h = black_box(&snapshots);
            (change_boost(h), error_penalty(h), cost_factor(h.first()))
        });
    });

    c.bench_function("backoff_seconds", |b| {
        b.iter(|| (1..=12).map(|a| backoff_seconds(black_box(a))).sum::<i64>());
    });
}

fn bench_content_metrics(c: &mut Criterion) {
    let previous: String = (0..400).map(|i| format!("line {i} [link](https://example.com/{i})\n")).collect();
    let current: String = (0..400)
        .map(|i| format!("line {} [link](https://example.com/{i})\n", i + i % 5))
        .collect();

    c.bench_function("content_metrics_400_lines", |b| {
        b.iter(|| content_metrics::compute(black_box(&current), 0, "", Some(black_box(&previous))));
    });
}

criterion_group!(benches, bench_signals, bench_content_metrics);
criterion_main!(benches);
