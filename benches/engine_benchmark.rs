// ========================================================================================
//
//                 Riskwatch chart engine performance benchmark
//
// ========================================================================================
//
// Compares the matrix engine, which materialises every subject's cumulative
// intensity at every construction time, with the recursive engine, which
// evaluates the baseline hazard on demand, as the number of subjects grows.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use riskwatch::hazard::WeibullHazard;
use riskwatch::{CgrChart, CgrSpec, Engine, Subject, SubjectTable};

/// Cohort sizes to benchmark.
const COHORT_SIZES: [usize; 4] = [100, 250, 500, 1000];
/// Entry times are spread over this many days.
const ACCRUAL_DAYS: f64 = 365.0;

fn simulate_cohort(n: usize) -> (SubjectTable, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(2024);
    let mut entries: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..ACCRUAL_DAYS)).collect();
    entries.sort_by(f64::total_cmp);
    let subjects = entries
        .into_iter()
        .map(|entry| Subject::new(entry, entry + rng.gen_range(1.0..120.0), rng.gen_bool(0.3)))
        .collect();
    let risk = Array1::from_iter((0..n).map(|_| rng.gen_range(0.5..2.0)));
    (SubjectTable::new(subjects).expect("sorted cohort"), risk)
}

fn bench_engines(c: &mut Criterion) {
    let hazard = WeibullHazard::new(1.2, 200.0).expect("weibull");
    let mut group = c.benchmark_group("cgr_engine");
    group.sample_size(10);

    for &n in &COHORT_SIZES {
        let (table, risk) = simulate_cohort(n);
        group.throughput(Throughput::Elements(n as u64));

        for engine in [Engine::Matrix, Engine::Recursive] {
            let chart = CgrChart::new(CgrSpec {
                engine,
                ..CgrSpec::default()
            })
            .expect("chart");
            group.bench_with_input(BenchmarkId::new(format!("{engine:?}"), n), &n, |b, _| {
                b.iter(|| {
                    let run = chart
                        .run(black_box(&table), risk.view(), &hazard)
                        .expect("run");
                    black_box(run.trace.len())
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_engines);
criterion_main!(benches);
