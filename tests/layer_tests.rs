use briny_conv::ConvError;
use briny_conv::batch::SampleBatch;
use briny_conv::geometry::{FilterGeometry, LayerDims};
use briny_conv::graph::{ComputationGraph, UnaryFunction};
use briny_conv::layer::{ConvolutionKind, ConvolutionalLayer, Layer, LayerConfig, PoolingKind, PoolingLayer};
use briny_conv::matrix::Matrix;
use briny_conv::weights::{ConvolutionVariant, Initialization, WeightRole};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn config(filters: usize, filter_size: usize) -> LayerConfig {
    LayerConfig {
        filters,
        filter_size,
        ..LayerConfig::default()
    }
}

fn sample(rng: &mut StdRng, dims: LayerDims) -> Vec<Matrix> {
    (0..dims.depth)
        .map(|_| {
            let data = (0..dims.area()).map(|_| rng.random_range(-1.0..1.0)).collect();
            Matrix::from_vec(dims.width, dims.height, data).unwrap()
        })
        .collect()
}

#[test]
fn test_depthwise_separable_topology() {
    let layer = ConvolutionalLayer::new(
        config(4, 3),
        LayerDims::new(5, 5, 3),
        ConvolutionVariant::DepthwiseSeparable,
        ConvolutionKind::Crosscorrelation,
        Initialization::UniformHe,
        1,
    )
    .unwrap();

    let weights = layer.weights();
    let count = |name: &str| weights.get(name).unwrap().parameter_count();
    assert_eq!(count("WD"), 27);
    assert_eq!(count("BD"), 27);
    assert_eq!(count("WP"), 12);
    assert_eq!(count("BP"), 36);
    assert!(weights.get("W").is_none());
    assert_eq!(layer.number_of_parameters(), 27 + 27 + 12 + 36);
    assert_eq!(
        layer.number_of_parameters(),
        weights.tensors().iter().map(|t| t.parameter_count()).sum::<usize>()
    );
    assert_eq!(layer.output_dims(), LayerDims::new(3, 3, 4));

    let wp = weights.get("WP").unwrap();
    assert_eq!((wp.fan_in(), wp.fan_out()), (3, 4));
    assert_eq!(weights.get("BP").unwrap().role(), WeightRole::Bias);
}

#[test]
fn test_standard_topology_and_regulation() {
    let mut cfg = config(2, 3);
    cfg.regulate_weights = true;
    let layer = ConvolutionalLayer::from_config(
        cfg,
        LayerDims::new(6, 6, 3),
        ConvolutionKind::Convolution,
        Initialization::NormalXavier,
        5,
    )
    .unwrap();

    assert_eq!(layer.variant(), ConvolutionVariant::Standard);
    let w = layer.weights().get("W").unwrap();
    assert_eq!(w.slices().len(), 6);
    assert_eq!((w.fan_in(), w.fan_out()), (27, 18));
    assert!(w.is_regulated());
    assert!(!layer.weights().get("B").unwrap().is_regulated());

    let regulated: Vec<&str> = layer.weights().regulated_weights().map(|t| t.name()).collect();
    assert_eq!(regulated, vec!["W"]);
    assert_eq!(layer.weights().trainable_weights().count(), 2);
}

#[test]
fn test_pointwise_ignores_spatial_filter() {
    let layer = ConvolutionalLayer::new(
        config(5, 3),
        LayerDims::new(4, 4, 2),
        ConvolutionVariant::Pointwise,
        ConvolutionKind::Convolution,
        Initialization::One,
        0,
    )
    .unwrap();
    assert_eq!(layer.output_dims(), LayerDims::new(4, 4, 5));
    assert_eq!(layer.weights().get("WP").unwrap().parameter_count(), 10);

    let out = layer.infer(&[Matrix::constant(4, 4, 1.0), Matrix::constant(4, 4, 2.0)]).unwrap();
    assert_eq!(out.len(), 5);
    assert!(out.iter().all(|m| m.values().iter().all(|&v| v == 3.0)));
}

#[test]
fn test_json_configuration_errors() {
    assert!(matches!(
        LayerConfig::from_json(r#"{"filters": 2, "kernel": 3}"#),
        Err(ConvError::Config(_))
    ));
    assert!(matches!(
        LayerConfig::from_json(r#"{"filters": "two"}"#),
        Err(ConvError::Config(_))
    ));
    assert!(matches!(LayerConfig::from_json(r#"{"stride": 0}"#), Err(ConvError::Config(_))));
    assert!(matches!(LayerConfig::from_json("not json"), Err(ConvError::Config(_))));
}

#[test]
fn test_json_configuration_overrides() {
    let cfg = LayerConfig::from_json(r#"{"filterSize": 5, "filterRowSize": 2, "isDepthSeparable": true}"#).unwrap();
    assert_eq!((cfg.filter_rows(), cfg.filter_columns()), (2, 5));
    assert!(cfg.is_depth_separable);
    assert_eq!(cfg.filters, 1);

    let back = LayerConfig::from_json(&cfg.to_json().unwrap()).unwrap();
    assert_eq!(back, cfg);

    let zeroed = LayerConfig {
        filter_column_size: Some(0),
        ..LayerConfig::default()
    };
    assert!(matches!(zeroed.validated(), Err(ConvError::Config(_))));
}

#[test]
fn test_filter_size_is_ignored_when_both_axes_are_overridden() {
    let cfg = LayerConfig::from_json(r#"{"filterSize": 0, "filterRowSize": 2, "filterColumnSize": 3}"#).unwrap();
    assert_eq!((cfg.filter_rows(), cfg.filter_columns()), (2, 3));
    assert_eq!(cfg.geometry().unwrap(), FilterGeometry::new(2, 3, 1, 1).unwrap());

    let half = LayerConfig::from_json(r#"{"filterSize": 0, "filterRowSize": 2}"#);
    assert!(matches!(half, Err(ConvError::Config(ref m)) if m.contains("filterSize")));

    let row = LayerConfig::from_json(r#"{"filterRowSize": 0, "filterColumnSize": 3}"#);
    assert!(matches!(row, Err(ConvError::Config(ref m)) if m.contains("filterRowSize")));
}

#[test]
fn test_huge_dilation_is_rejected_by_constructor() {
    let cfg = LayerConfig::from_json(r#"{"filterSize": 3, "dilation": 9223372036854775809}"#).unwrap();
    let err = ConvolutionalLayer::from_config(
        cfg.clone(),
        LayerDims::new(5, 5, 1),
        ConvolutionKind::Convolution,
        Initialization::default(),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, ConvError::Dimension(_)));
    assert!(matches!(
        PoolingLayer::from_config(PoolingKind::Max, cfg, LayerDims::new(5, 5, 1)),
        Err(ConvError::Dimension(_))
    ));
}

#[test]
fn test_single_variant_collapses_depth() {
    let layer = ConvolutionalLayer::new(
        config(4, 3),
        LayerDims::new(5, 5, 3),
        ConvolutionVariant::Single,
        ConvolutionKind::Crosscorrelation,
        Initialization::One,
        0,
    )
    .unwrap();
    assert_eq!(layer.input_dims(), LayerDims::new(5, 5, 1));
    assert_eq!(layer.output_dims(), LayerDims::new(3, 3, 1));
    assert_eq!(layer.number_of_parameters(), 18);
    assert_eq!(layer.weights().get("W").unwrap().slices().len(), 1);
    assert_eq!(layer.weights().get("B").unwrap().slices().len(), 1);
    assert!(layer.details().contains("filters 1"));

    let out = layer.infer(&[Matrix::constant(5, 5, 1.0)]).unwrap();
    assert_eq!(out.len(), 1);
    assert!(out[0].values().iter().all(|&v| v == 9.0));

    let three = vec![Matrix::constant(5, 5, 1.0); 3];
    assert!(matches!(layer.infer(&three), Err(ConvError::Dimension(_))));
}

#[test]
fn test_invalid_config_is_rejected_by_constructor() {
    let err = ConvolutionalLayer::new(
        config(0, 3),
        LayerDims::new(5, 5, 1),
        ConvolutionVariant::Standard,
        ConvolutionKind::Convolution,
        Initialization::default(),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, ConvError::Config(_)));
}

#[test]
fn test_reinitialize_zeroes_biases() {
    let mut layer = ConvolutionalLayer::new(
        config(2, 2),
        LayerDims::new(4, 4, 1),
        ConvolutionVariant::Standard,
        ConvolutionKind::Crosscorrelation,
        Initialization::Constant(0.5),
        3,
    )
    .unwrap();

    layer.weights_mut().get_mut("B").unwrap().slices_mut()[0].fill(9.0);
    layer.weights_mut().get_mut("W").unwrap().slices_mut()[1].fill(-1.0);
    layer.reinitialize().unwrap();

    let weights = layer.weights();
    assert!(weights.get("W").unwrap().slices().iter().all(|m| m.values() == vec![0.5; 4]));
    assert!(weights.get("B").unwrap().slices().iter().all(|m| m.sum() == 0.0));
}

#[test]
fn test_custom_initialization_receives_fans() {
    let layer = ConvolutionalLayer::new(
        config(1, 2),
        LayerDims::new(3, 3, 2),
        ConvolutionVariant::Standard,
        ConvolutionKind::Convolution,
        Initialization::custom(|r, c, fan_in, _| (r * 10 + c + fan_in * 100) as f64),
        0,
    )
    .unwrap();
    let w = layer.weights().get("W").unwrap();
    assert_eq!(w.slices()[0].values(), vec![800.0, 801.0, 810.0, 811.0]);
}

#[test]
fn test_same_seed_reproduces_weights() {
    let build = |seed| {
        ConvolutionalLayer::new(
            config(2, 3),
            LayerDims::new(5, 5, 2),
            ConvolutionVariant::Standard,
            ConvolutionKind::Convolution,
            Initialization::NormalHe,
            seed,
        )
        .unwrap()
    };
    let values = |layer: &ConvolutionalLayer| layer.weights().get("W").unwrap().slices()[3].values();
    assert_eq!(values(&build(11)), values(&build(11)));
    assert_ne!(values(&build(11)), values(&build(12)));
}

#[test]
fn test_winograd_rejects_other_filter_sizes() {
    let err = ConvolutionalLayer::new(
        config(1, 5),
        LayerDims::new(9, 9, 1),
        ConvolutionVariant::Standard,
        ConvolutionKind::Winograd,
        Initialization::default(),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, ConvError::Geometry(_)));
}

#[test]
fn test_winograd_layer_matches_convolution_layer() {
    let build = |kind| {
        ConvolutionalLayer::new(
            config(2, 3),
            LayerDims::new(6, 6, 2),
            ConvolutionVariant::Standard,
            kind,
            Initialization::UniformXavier,
            21,
        )
        .unwrap()
    };
    let direct = build(ConvolutionKind::Convolution);
    let fast = build(ConvolutionKind::Winograd);
    let mut rng = StdRng::seed_from_u64(4);
    let input = sample(&mut rng, LayerDims::new(6, 6, 2));

    let a = direct.infer(&input).unwrap();
    let b = fast.infer(&input).unwrap();
    for (x, y) in a.iter().zip(&b) {
        for (p, q) in x.values().iter().zip(y.values()) {
            assert!((p - q).abs() < 1e-9, "{p} vs {q}");
        }
    }
}

#[test]
fn test_depth_separable_flag_requires_matching_filters() {
    let mut cfg = config(4, 3);
    cfg.is_depth_separable = true;
    let err = ConvolutionalLayer::from_config(
        cfg.clone(),
        LayerDims::new(5, 5, 3),
        ConvolutionKind::Convolution,
        Initialization::default(),
        0,
    )
    .unwrap_err();
    assert!(matches!(err, ConvError::Dimension(_)));

    cfg.filters = 3;
    let layer = ConvolutionalLayer::from_config(
        cfg,
        LayerDims::new(5, 5, 3),
        ConvolutionKind::Convolution,
        Initialization::default(),
        0,
    )
    .unwrap();
    assert_eq!(layer.variant(), ConvolutionVariant::Depthwise);
    assert_eq!(layer.output_dims(), LayerDims::new(3, 3, 3));
}

#[test]
fn test_forward_rejects_wrong_sample() {
    let layer = ConvolutionalLayer::new(
        config(1, 3),
        LayerDims::new(5, 5, 2),
        ConvolutionVariant::Standard,
        ConvolutionKind::Convolution,
        Initialization::default(),
        0,
    )
    .unwrap();
    assert!(matches!(layer.infer(&[Matrix::new(5, 5)]), Err(ConvError::Dimension(_))));
    assert!(matches!(
        layer.infer(&[Matrix::new(5, 5), Matrix::new(5, 4)]),
        Err(ConvError::Dimension(_))
    ));
}

#[test]
fn test_layer_gradients_reach_weights_and_biases() {
    let layer = ConvolutionalLayer::new(
        config(1, 3),
        LayerDims::new(4, 4, 1),
        ConvolutionVariant::Standard,
        ConvolutionKind::Crosscorrelation,
        Initialization::One,
        0,
    )
    .unwrap();
    let input = Matrix::constant(4, 4, 1.0);

    let mut graph = ComputationGraph::new();
    let out = layer.forward(&mut graph, std::slice::from_ref(&input)).unwrap();
    assert_eq!(out[0].values(), vec![9.0; 4]);
    let loss = graph.sum(&out[0]).unwrap();
    let grads = graph.backward(&loss, &Matrix::constant(1, 1, 1.0)).unwrap();

    let w = &layer.weights().get("W").unwrap().slices()[0];
    let b = &layer.weights().get("B").unwrap().slices()[0];
    assert_eq!(grads.get(w).unwrap().values(), vec![4.0; 9]);
    assert_eq!(grads.get(b).unwrap().values(), vec![1.0; 4]);
    // corners are covered by one window, the centre by all four
    let dx = grads.get(&input).unwrap();
    assert_eq!(dx.get(0, 0), 1.0);
    assert_eq!(dx.get(1, 1), 4.0);
}

#[test]
fn test_relu_activation_clamps_outputs() {
    let layer = ConvolutionalLayer::new(
        config(3, 2),
        LayerDims::new(5, 5, 2),
        ConvolutionVariant::Standard,
        ConvolutionKind::Convolution,
        Initialization::UniformXavier,
        8,
    )
    .unwrap()
    .with_activation(UnaryFunction::RELU);
    assert!(layer.details().contains("relu"));

    let mut rng = StdRng::seed_from_u64(2);
    let out = layer.infer(&sample(&mut rng, LayerDims::new(5, 5, 2))).unwrap();
    assert!(out.iter().all(|m| m.values().iter().all(|&v| v >= 0.0)));
}

#[test]
fn test_pooling_layer_dims_and_forward() {
    let cfg = LayerConfig {
        filter_size: 2,
        stride: 2,
        ..LayerConfig::default()
    };
    let layer = PoolingLayer::from_config(PoolingKind::Max, cfg, LayerDims::new(4, 6, 2)).unwrap();
    assert_eq!(layer.output_dims(), LayerDims::new(2, 3, 2));

    let a = Matrix::from_vec(4, 6, (0..24).map(f64::from).collect()).unwrap();
    let b = a.multiply_constant(-1.0);
    let out = layer.infer(&[a, b]).unwrap();
    assert_eq!(out[0].values(), vec![7.0, 9.0, 11.0, 19.0, 21.0, 23.0]);
    assert_eq!(out[1].values(), vec![0.0, -2.0, -4.0, -12.0, -14.0, -16.0]);

    assert!(matches!(
        PoolingLayer::new(PoolingKind::Average, FilterGeometry::new(3, 3, 2, 1).unwrap(), LayerDims::new(4, 4, 1)),
        Err(ConvError::Dimension(_))
    ));
}

#[test]
fn test_seeded_random_pooling_layer_is_reproducible() {
    let geometry = FilterGeometry::new(2, 2, 2, 1).unwrap();
    let dims = LayerDims::new(4, 4, 1);
    let input = [Matrix::from_vec(4, 4, (0..16).map(f64::from).collect()).unwrap()];
    let first = PoolingLayer::with_seed(PoolingKind::Random, geometry, dims, 77).unwrap();
    let second = PoolingLayer::with_seed(PoolingKind::Random, geometry, dims, 77).unwrap();
    assert_eq!(first.infer(&input).unwrap()[0].values(), second.infer(&input).unwrap()[0].values());
}

#[test]
fn test_infer_batch_matches_infer() {
    let dims = LayerDims::new(5, 5, 2);
    let layer = ConvolutionalLayer::new(
        config(2, 3),
        dims,
        ConvolutionVariant::Standard,
        ConvolutionKind::Crosscorrelation,
        Initialization::NormalLeCun,
        13,
    )
    .unwrap();

    let mut rng = StdRng::seed_from_u64(6);
    let batch = SampleBatch::new(2);
    for index in [0, 3, 7] {
        batch.put(index, sample(&mut rng, dims)).unwrap();
    }
    assert_eq!(batch.indices(), vec![0, 3, 7]);

    let results = layer.infer_batch(&batch).unwrap();
    assert_eq!(results.len(), 3);
    for (index, outputs) in &results {
        let expected = layer.infer(&batch.get(*index).unwrap()).unwrap();
        for (x, y) in outputs.iter().zip(&expected) {
            assert_eq!(x.values(), y.values());
        }
    }
}

#[test]
fn test_batch_rejects_wrong_depth() {
    let batch = SampleBatch::new(3);
    assert!(matches!(batch.put(0, vec![Matrix::new(2, 2)]), Err(ConvError::Dimension(_))));
    assert!(batch.is_empty());
    batch.put(1, vec![Matrix::new(2, 2); 3]).unwrap();
    assert_eq!(batch.take(1).map(|s| s.len()), Some(3));
    assert!(batch.get(1).is_none());
}
