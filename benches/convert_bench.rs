// Benchmark for layer conversion throughput
// Run with: cargo bench

use criterion::{Criterion, criterion_group, criterion_main};
use layerstream::config::{ScannerConfig, SyntheticConfig};
use layerstream::converter::LayerConverter;
use layerstream::synthetic::{SyntheticSource, test_styles};

fn bench_convert_dense_layer(c: &mut Criterion) {
    let synthetic = SyntheticConfig {
        part_size_mm: 100.0,
        hatch_spacing_mm: 0.01,
        ..SyntheticConfig::default()
    };
    let styles = test_styles(&synthetic);
    let layer = SyntheticSource::new(0.03, 1, synthetic).layer(0);
    let converter = LayerConverter::from_scanner(&ScannerConfig::default());
    c.bench_function("convert 10k hatch lines", |b| {
        b.iter(|| {
            let block = converter.convert(layer.clone(), &styles).unwrap();
            assert_eq!(block.parameter_segments.len(), 2);
        });
    });
}

fn bench_convert_synthetic_stack(c: &mut Criterion) {
    let synthetic = SyntheticConfig::default();
    let styles = test_styles(&synthetic);
    let source = SyntheticSource::new(0.03, 100, synthetic);
    let layers: Vec<_> = (0..100).map(|i| source.layer(i)).collect();
    let converter = LayerConverter::from_scanner(&ScannerConfig::default());
    c.bench_function("convert 100 synthetic layers", |b| {
        b.iter(|| {
            let commands: usize = layers
                .iter()
                .map(|l| converter.convert(l.clone(), &styles).unwrap().len())
                .sum();
            assert!(commands > 0);
        });
    });
}

criterion_group!(benches, bench_convert_dense_layer, bench_convert_synthetic_stack);
criterion_main!(benches);
