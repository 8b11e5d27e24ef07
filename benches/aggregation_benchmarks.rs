use chrono::{Days, NaiveDate};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use loadrs::aggregator::{LoadAggregator, WindowSample};
use loadrs::models::{AcwrParameters, ActivityRecord};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Aggregation throughput benchmarks
///
/// Snapshot computation over growing histories, with and without decay.

fn start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2023, 1, 1).unwrap()
}

fn create_history(days: u64) -> Vec<ActivityRecord> {
    (0..days)
        .filter(|d| d % 7 != 6)
        .map(|d| ActivityRecord {
            id: format!("bench-{d}"),
            user_id: "bench".to_string(),
            date: start().checked_add_days(Days::new(d)).unwrap(),
            duration_seconds: 2400 + (d as u32 % 5) * 600,
            distance_meters: Some(Decimal::from(6000 + (d % 4) * 2500)),
            elevation_gain_meters: Some(Decimal::from(d % 9 * 20)),
            avg_heart_rate: Some(140),
            max_heart_rate: Some(170),
            trimp: Some(Decimal::from(40 + d % 30)),
            external_load: None,
        })
        .collect()
}

fn bench_snapshot_calculation(c: &mut Criterion) {
    let mut group = c.benchmark_group("Snapshot Calculation");

    for &days in &[90u64, 365, 730] {
        let records = create_history(days);
        let end = start().checked_add_days(Days::new(days - 1)).unwrap();

        for (label, decay) in [("flat", Decimal::ZERO), ("decayed", dec!(0.1))] {
            let aggregator = LoadAggregator::new(AcwrParameters::new(42, decay).unwrap());

            group.throughput(Throughput::Elements(days));
            group.bench_with_input(BenchmarkId::new(label, days), &records, |b, records| {
                b.iter(|| {
                    aggregator
                        .calculate_snapshots("bench", black_box(records), Some(start()), start(), end, None)
                        .unwrap()
                });
            });
        }
    }

    group.finish();
}

fn bench_window_mean(c: &mut Criterion) {
    let mut group = c.benchmark_group("Window Mean");

    for &window in &[28u16, 90] {
        let samples: Vec<WindowSample> = (0..window)
            .map(|k| WindowSample {
                days_ago: k,
                value: Decimal::from(k % 11),
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("decay_0.05", window), &samples, |b, samples| {
            b.iter(|| LoadAggregator::window_mean(black_box(samples), dec!(0.05)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_snapshot_calculation, bench_window_mean);
criterion_main!(benches);
