use std::io::Write;
use tmeasure_core::{ConvAggregation, ExecutorConfig, MeasureFunction, Sign, SimpleSetSizes};
use tmeasure_sim::{run_experiment, DatasetConfig, ExperimentConfig, MeasureSpec};

fn small(rotations: usize) -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.dataset = DatasetConfig {
        samples: 8,
        size: 8,
        classes: 2,
        ..DatasetConfig::default()
    };
    config.model.channels = 3;
    config.transformations = SimpleSetSizes {
        rotations,
        scales: 0,
        translations: 0,
    };
    config.iterator.batch_size = 4;
    config
}

#[test]
fn test_every_measure_kind_runs() {
    let mut config = small(4);
    config.measures = vec![
        MeasureSpec::NormalizedVariance {
            aggregation: ConvAggregation::Mean,
        },
        MeasureSpec::StratifiedNormalizedVariance {
            aggregation: ConvAggregation::Mean,
        },
        MeasureSpec::TransformationStatistic {
            function: MeasureFunction::Std,
            aggregation: ConvAggregation::None,
        },
        MeasureSpec::SampleStatistic {
            function: MeasureFunction::Mean,
            aggregation: ConvAggregation::Sum,
        },
        MeasureSpec::FiringRate {
            alpha: 0.9,
            sign: Sign::Positive,
        },
        MeasureSpec::AlignmentDistance {
            aggregation: ConvAggregation::Mean,
        },
    ];

    let report = run_experiment(&config, ExecutorConfig::default()).unwrap();
    assert_eq!(report.transformation_count, 4);
    assert_eq!(report.results.len(), 6);

    let all_layers = vec!["conv1", "relu1", "pool1", "fc"];
    for result in &report.results[..5] {
        assert_eq!(result.layer_names, all_layers);
    }

    // mean-aggregated conv layers collapse to one value per channel
    let nv = &report.results[0];
    assert_eq!(nv.layers[0].shape(), &[3]);
    assert_eq!(nv.layers[3].shape(), &[2]);

    let stratified = &report.results[1];
    assert!(stratified.auxiliary("class_0").is_some());
    assert!(stratified.auxiliary("class_1").is_some());

    let std = &report.results[2];
    assert_eq!(std.layers[0].shape(), &[3, 8, 8]);
    assert!(std.layers.iter().all(|l| l.iter().all(|v| *v >= 0.0)));

    let firing = &report.results[4];
    let local = firing.auxiliary("local").unwrap();
    assert!(local
        .layers
        .iter()
        .all(|l| l.iter().all(|v| (0.0..=1.0).contains(v))));
    assert!(firing.auxiliary("thresholds").is_some());

    // only spatial layers survive alignment
    let distance = &report.results[5];
    assert_eq!(distance.layer_names, vec!["conv1", "relu1", "pool1"]);
    assert!(distance.layers.iter().all(|l| l.iter().all(|v| *v >= 0.0)));
}

#[test]
fn test_identity_set_has_no_transformation_variance() {
    let mut config = small(0);
    config.measures = vec![MeasureSpec::TransformationStatistic {
        function: MeasureFunction::Var,
        aggregation: ConvAggregation::None,
    }];

    let report = run_experiment(&config, ExecutorConfig::default()).unwrap();
    assert_eq!(report.transformation_count, 1);
    for layer in &report.results[0].layers {
        assert!(layer.iter().all(|v| *v == 0.0));
    }
}

#[test]
fn test_identity_alignment_distance_is_zero() {
    let mut config = small(0);
    config.measures = vec![MeasureSpec::AlignmentDistance {
        aggregation: ConvAggregation::None,
    }];

    let report = run_experiment(&config, ExecutorConfig::default()).unwrap();
    for layer in &report.results[0].layers {
        assert!(layer.iter().all(|v| v.abs() < 1e-9));
    }
}

#[test]
fn test_runs_are_reproducible() {
    let config = small(4);
    let a = run_experiment(&config, ExecutorConfig::default()).unwrap();
    let b = run_experiment(
        &config,
        ExecutorConfig {
            channel_capacity: 1,
        },
    )
    .unwrap();
    assert_eq!(a.digest, b.digest);
    assert_eq!(a.results[0].layers, b.results[0].layers);
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[dataset]
samples = 6
size = 8
classes = 3

[transformations]
rotations = 2
scales = 1
translations = 0

[iterator]
batch_size = 3
variant = "inverted"

[[measures]]
kind = "normalized_variance"
aggregation = "max"
"#
    )
    .unwrap();

    let config = ExperimentConfig::load(file.path()).unwrap();
    assert_eq!(config.dataset.samples, 6);
    assert_eq!(config.measures.len(), 1);

    let report = run_experiment(&config, ExecutorConfig::default()).unwrap();
    // two rotations times baseline plus one shrink
    assert_eq!(report.transformation_count, 4);
    // the inverted variant only hands out spatial layers
    assert_eq!(report.results[0].layer_names, vec!["conv1", "relu1", "pool1"]);
}

#[test]
fn test_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    assert!(ExperimentConfig::load(&dir.path().join("absent.toml")).is_err());
}

#[test]
fn test_zero_capacity_rejected() {
    let config = small(2);
    assert!(run_experiment(
        &config,
        ExecutorConfig {
            channel_capacity: 0
        }
    )
    .is_err());
}

#[test]
fn test_default_config_round_trips_through_toml() {
    let text = toml::to_string_pretty(&ExperimentConfig::default()).unwrap();
    let parsed = ExperimentConfig::from_toml_str(&text).unwrap();
    assert_eq!(parsed.measures, ExperimentConfig::default().measures);
}

#[test]
fn test_distance_kinds_run() {
    let mut config = small(4);
    config.measures = vec![
        MeasureSpec::NormalizedDistance {
            normalize: false,
            keep_feature_maps: true,
        },
        MeasureSpec::DistanceEquivariance {
            normalize: true,
            keep_feature_maps: false,
        },
    ];
    let report = run_experiment(&config, ExecutorConfig::default()).unwrap();
    assert_eq!(report.results[0].layers[0].shape(), &[3]);
    assert_eq!(report.results[1].layer_names, vec!["conv1", "relu1", "pool1"]);
    assert_eq!(report.results[1].layers[0].shape(), &[3, 8, 8]);
}

#[test]
fn test_report_json_round_trip() {
    let mut config = small(4);
    config.measures = vec![MeasureSpec::NormalizedVariance {
        aggregation: ConvAggregation::None,
    }];
    let report = run_experiment(&config, ExecutorConfig::default()).unwrap();
    let json = serde_json::to_string(&report).unwrap();
    let back: tmeasure_sim::ExperimentReport = serde_json::from_str(&json).unwrap();
    assert_eq!(back.digest, report.digest);
    for (a, b) in back.results[0].layers.iter().zip(&report.results[0].layers) {
        assert_eq!(a.shape(), b.shape());
        assert!(a.iter().zip(b.iter()).all(|(x, y)| x == y || (x.is_nan() && y.is_nan())));
    }
}

#[test]
fn test_small_class_with_default_batch_is_an_error() {
    let mut config = small(2);
    config.iterator.batch_size = 32;
    config.measures = vec![MeasureSpec::SampleStatistic {
        function: MeasureFunction::Var,
        aggregation: ConvAggregation::None,
    }];
    assert!(run_experiment(&config, ExecutorConfig::default()).is_err());
}
