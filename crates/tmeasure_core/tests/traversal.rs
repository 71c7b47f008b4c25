//! Traversal orders enumerate the same cross product.

mod common;

use common::{PatternDataset, PassthroughModel};
use std::collections::BTreeMap;
use tmeasure_core::{
    ActivationGroup, ActivationsIterator, IteratorConfig, IteratorVariant, TransformationSet,
};

fn pair_counts(pairs: impl Iterator<Item = (usize, usize)>) -> BTreeMap<(usize, usize), usize> {
    let mut counts = BTreeMap::new();
    for pair in pairs {
        *counts.entry(pair).or_insert(0) += 1;
    }
    counts
}

#[test]
fn test_orders_visit_same_pairs() {
    let model = PassthroughModel;
    let data = PatternDataset::new(6);
    let set = TransformationSet::simple(3, 1, 1);
    let config = IteratorConfig::default().with_batch_size(3);
    let it = ActivationsIterator::build(&model, &data, &set, config).unwrap();

    let mut samples_first = Vec::new();
    for group in it.samples_first() {
        for batch in group.unwrap().into_batches() {
            samples_first.extend(batch.unwrap().pairs());
        }
    }

    let mut transformations_first = Vec::new();
    for group in it.transformations_first() {
        for batch in group.unwrap().into_batches() {
            transformations_first.extend(batch.unwrap().pairs());
        }
    }

    let expected = data.len * set.len();
    assert_eq!(samples_first.len(), expected);
    assert_eq!(transformations_first.len(), expected);
    assert_eq!(pair_counts(samples_first.into_iter()), pair_counts(transformations_first.into_iter()));
}

#[test]
fn test_set_order_is_stable() {
    let set = TransformationSet::simple(4, 2, 1);
    let first: Vec<_> = set.iter().map(|t| t.parameters()).collect();
    let second: Vec<_> = set.iter().map(|t| t.parameters()).collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 4 * 3 * 9);
}

#[test]
fn test_double_inverse_is_exact() {
    let set = TransformationSet::simple(5, 3, 2);
    for t in &set {
        assert_eq!(t.inverse().inverse().parameters(), t.parameters());
    }
    for i in 0..set.len() {
        let inv = set.inverse(i).unwrap();
        assert_eq!(inv.inverse(), *set.get(i).unwrap());
    }
}

#[test]
fn test_group_indices_follow_order() {
    let model = PassthroughModel;
    let data = PatternDataset::new(4);
    let set = TransformationSet::simple(2, 0, 0);
    let it = ActivationsIterator::build(&model, &data, &set, IteratorConfig::default().with_batch_size(2))
        .unwrap();

    let samples: Vec<usize> = it.samples_first().map(|g| g.unwrap().index()).collect();
    assert_eq!(samples, vec![0, 1, 2, 3]);
    let transformations: Vec<usize> = it.transformations_first().map(|g| g.unwrap().index()).collect();
    assert_eq!(transformations, vec![0, 1]);
}

#[test]
fn test_aligned_variants_drop_flat_layers() {
    let model = PassthroughModel;
    let data = PatternDataset::new(2);
    let set = TransformationSet::simple(2, 0, 0);
    for variant in [IteratorVariant::Inverted, IteratorVariant::Both] {
        let config = IteratorConfig::default().with_variant(variant);
        let it = ActivationsIterator::build(&model, &data, &set, config).unwrap();
        assert_eq!(it.layer_names(), &["identity".to_string()]);
        for group in it.samples_first() {
            for batch in group.unwrap().into_batches() {
                let batch = batch.unwrap();
                assert_eq!(batch.activations.len(), 1);
                if variant == IteratorVariant::Both {
                    assert_eq!(batch.baseline.as_ref().map(Vec::len), Some(1));
                } else {
                    assert!(batch.baseline.is_none());
                }
            }
        }
    }
}

#[test]
fn test_model_failure_surfaces() {
    use ndarray::ArrayView4;
    use tmeasure_core::{ForwardPass, MeasureError, ObservableModel};

    struct Broken;
    impl ObservableModel for Broken {
        fn layer_names(&self) -> Vec<String> {
            vec!["x".into()]
        }
        fn forward_pass(&self, _batch: ArrayView4<'_, f32>) -> anyhow::Result<ForwardPass> {
            anyhow::bail!("device lost")
        }
    }

    let data = PatternDataset::new(2);
    let set = TransformationSet::identity();
    let it = ActivationsIterator::build(&Broken, &data, &set, IteratorConfig::default()).unwrap();
    let group = it.samples_first().next().unwrap().unwrap();
    let err = group.into_batches().next().unwrap().unwrap_err();
    assert!(matches!(err, MeasureError::Collaborator(_)));
}
