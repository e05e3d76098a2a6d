use bsfh_gp::{DataUpdate, FluxScale, GaussianProcess, Matern32, ObservationData};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::{Array1, array};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal, Uniform};

fn random_spectrum(size: usize) -> (ObservationData, Array1<f64>) {
    let mut rng = StdRng::seed_from_u64(0x5EED_F64 + size as u64);
    let noise = Uniform::new(0.05, 0.2);
    let residual = Normal::new(0.0, 0.1).unwrap();
    let wave = Array1::from_shape_fn(size, |i| 4000.0 + 0.5 * i as f64);
    let sigma = Array1::from_shape_fn(size, |_| noise.sample(&mut rng));
    let r = Array1::from_shape_fn(size, |_| residual.sample(&mut rng));
    (
        ObservationData::new(wave, sigma, FluxScale::Unit).unwrap(),
        r,
    )
}

fn benchmark_lnlikelihood(c: &mut Criterion) {
    let sizes = [100_usize, 400, 1000];
    let spectra: Vec<_> = sizes
        .iter()
        .map(|&size| (size, random_spectrum(size)))
        .collect();

    let mut group = c.benchmark_group("lnlikelihood");
    for (size, (data, residual)) in spectra.iter() {
        group.throughput(Throughput::Elements((*size * *size) as u64));

        let mut gp = GaussianProcess::with_data(Matern32, data.clone())
            .with_kernel(array![-3.0, -2.0, 1.0])
            .unwrap();

        group.bench_with_input(BenchmarkId::new("cached", size), residual, |b, input| {
            b.iter(|| {
                let lnl = gp.lnlikelihood(black_box(input.view())).unwrap();
                black_box(lnl);
            });
        });

        group.bench_with_input(BenchmarkId::new("rebuild", size), residual, |b, input| {
            b.iter(|| {
                gp.compute_with(DataUpdate::default(), true).unwrap();
                let lnl = gp.lnlikelihood(black_box(input.view())).unwrap();
                black_box(lnl);
            });
        });
    }
    group.finish();
}

criterion_group!(likelihood, benchmark_lnlikelihood);
criterion_main!(likelihood);
