use briny_conv::ConvError;
use briny_conv::matrix;
use briny_conv::matrix::Matrix;
use briny_conv::matrix::mask::{Mask, MaskLayer};
use rand::SeedableRng;
use rand::rngs::StdRng;

#[test]
fn test_matrix_macro() {
    let m = matrix!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    assert_eq!((m.rows(), m.columns()), (2, 3));
    assert_eq!(m.values(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(m.get(1, 0), 4.0);
}

#[test]
fn test_from_vec_shape_mismatch() {
    assert!(matches!(Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0]), Err(ConvError::Shape(_))));
}

#[test]
fn test_ragged_literal_panics() {
    let result = std::panic::catch_unwind(|| Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0]]));
    assert!(result.is_err());
}

#[test]
fn test_masked_sum_and_mean_skip_excluded_positions() {
    let mut m = Matrix::from_vec(3, 4, (1..=12).map(f64::from).collect()).unwrap();
    m.set_mask();
    m.set_mask_at(0, 1, true).unwrap();
    m.set_row_mask(2, true).unwrap();
    m.set_column_mask(3, true).unwrap();

    let mut expected = Vec::new();
    for r in 0..3 {
        for c in 0..4 {
            let excluded = (r == 0 && c == 1) || r == 2 || c == 3;
            if !excluded {
                expected.push(m.get(r, c));
            }
        }
    }
    let sum: f64 = expected.iter().sum();
    assert_eq!(m.count_unmasked(), expected.len());
    assert_eq!(m.sum(), sum);
    assert_eq!(m.mean(), sum / expected.len() as f64);
    assert_eq!(m.mask().unwrap().count_masked(), 12 - expected.len());
}

#[test]
fn test_fully_masked_mean_is_zero() {
    let mut m = Matrix::constant(2, 2, 5.0);
    m.set_mask();
    m.set_row_mask(0, true).unwrap();
    m.set_row_mask(1, true).unwrap();
    assert_eq!(m.sum(), 0.0);
    assert_eq!(m.mean(), 0.0);
    assert_eq!(m.variance(), 0.0);
    assert_eq!(m.max(), None);
}

#[test]
fn test_unset_mask_access_fails() {
    let mut m = Matrix::new(2, 2);
    assert!(matches!(m.mask(), Err(ConvError::Mask(_))));
    assert!(matches!(m.mask_mut(), Err(ConvError::Mask(_))));
    assert!(matches!(m.set_mask_at(0, 0, true), Err(ConvError::Mask(_))));
    assert!(matches!(m.set_row_mask(0, true), Err(ConvError::Mask(_))));
}

#[test]
fn test_mask_stack_push_and_pop() {
    let mut m = Matrix::new(2, 2);
    m.set_mask();
    m.set_mask_at(0, 0, true).unwrap();

    m.stack_mask(true);
    assert_eq!(m.mask_stack_size(MaskLayer::Element), 1);
    assert!(!m.is_masked(0, 0));
    m.set_mask_at(1, 1, true).unwrap();

    m.stack_mask(false);
    assert!(m.is_masked(1, 1));
    m.unstack_mask().unwrap();
    assert!(m.is_masked(1, 1));

    m.unstack_mask().unwrap();
    assert!(m.is_masked(0, 0));
    assert!(!m.is_masked(1, 1));
    assert!(matches!(m.unstack_mask(), Err(ConvError::Mask(_))));
}

#[test]
fn test_snapshot_is_not_mutated_by_later_edits() {
    let mut m = Matrix::new(1, 3);
    m.set_mask();
    m.stack_mask(false);
    m.set_mask_at(0, 2, true).unwrap();
    m.unstack_mask().unwrap();
    assert!(!m.is_masked(0, 2));
}

#[test]
fn test_row_and_column_mask_stacks() {
    let mut m = Matrix::new(3, 3);
    m.set_mask();
    m.set_row_mask(1, true).unwrap();
    m.set_column_mask(2, true).unwrap();
    m.set_mask_at(0, 0, true).unwrap();

    m.stack_row_mask(true);
    m.stack_column_mask(true);
    assert!(!m.is_masked(1, 1));
    assert!(!m.is_masked(0, 2));
    assert!(m.is_masked(0, 0));

    m.unstack_column_mask().unwrap();
    assert!(m.is_masked(0, 2));
    assert!(!m.is_masked(1, 1));
    m.unstack_row_mask().unwrap();
    assert!(m.is_masked(1, 1));

    assert!(matches!(m.unstack_row_mask(), Err(ConvError::Mask(_))));
    assert!(matches!(m.unstack_column_mask(), Err(ConvError::Mask(_))));
}

#[test]
fn test_clear_mask_stack() {
    let mut m = Matrix::new(2, 2);
    m.stack_mask(true);
    m.stack_mask(true);
    m.clear_mask_stack(MaskLayer::Element);
    assert_eq!(m.mask_stack_size(MaskLayer::Element), 0);
    assert!(m.unstack_mask().is_err());
}

#[test]
fn test_probability_masking() {
    let mut rng = StdRng::seed_from_u64(9);
    let mut mask = Mask::new(4, 5);
    assert!(matches!(mask.mask_by_probability(1.5, &mut rng), Err(ConvError::Mask(_))));
    assert!(matches!(mask.mask_rows_by_probability(-0.1, &mut rng), Err(ConvError::Mask(_))));

    mask.mask_by_probability(1.0, &mut rng).unwrap();
    assert_eq!(mask.count_masked(), 20);
    mask.mask_by_probability(0.0, &mut rng).unwrap();
    assert!(mask.is_clear());

    mask.mask_columns_by_probability(1.0, &mut rng).unwrap();
    assert!((0..5).all(|c| mask.column(c)));
}

#[test]
fn test_mask_union() {
    let mut a = Mask::new(2, 2);
    a.set(0, 0, true);
    let mut b = Mask::new(2, 2);
    b.set_row(1, true);
    let u = a.union(&b).unwrap();
    assert!(u.is_masked(0, 0) && u.is_masked(1, 0) && u.is_masked(1, 1));
    assert!(!u.is_masked(0, 1));
    assert!(matches!(a.union(&Mask::new(3, 2)), Err(ConvError::Shape(_))));
}

#[test]
fn test_slice_window_addressing() {
    let mut m = Matrix::from_vec(3, 4, (0..12).map(f64::from).collect()).unwrap();
    m.slice_at(1, 1, 2, 2).unwrap();
    assert_eq!((m.rows(), m.columns()), (2, 2));
    assert_eq!(m.values(), vec![5.0, 6.0, 9.0, 10.0]);
    assert_eq!(m.sum(), 30.0);

    m.set(0, 0, -1.0);
    m.unslice();
    assert_eq!(m.get(1, 1), -1.0);
    assert_eq!((m.rows(), m.columns()), (3, 4));

    assert!(matches!(m.slice_at(2, 2, 2, 2), Err(ConvError::Dimension(_))));
    assert!(matches!(m.slice_at(0, 0, 0, 1), Err(ConvError::Dimension(_))));
}

#[test]
fn test_window_view() {
    let m = Matrix::from_vec(3, 3, (0..9).map(f64::from).collect()).unwrap();
    let w = m.window(1, 1, 2, 2).unwrap();
    assert_eq!(w.get(1, 0), 7.0);
    assert!(!w.is_masked(0, 0));
    assert!(matches!(m.window(2, 2, 2, 2), Err(ConvError::Dimension(_))));
}

#[test]
fn test_transpose_swaps_reads_and_mask() {
    let mut m = matrix!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    m.set_mask();
    m.set_mask_at(0, 2, true).unwrap();
    let t = m.transpose();
    assert!(t.is_transposed());
    assert_eq!((t.rows(), t.columns()), (3, 2));
    assert_eq!(t.values(), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    assert!(t.is_masked(2, 0));
    assert_ne!(t.id(), m.id());
}

#[test]
fn test_flip_reverses_both_axes() {
    let m = matrix!([[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);
    assert_eq!(m.flip().values(), vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]);
}

#[test]
fn test_dot_product() {
    let a = matrix!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
    let b = matrix!([[7.0, 8.0], [9.0, 10.0], [11.0, 12.0]]);
    let c = a.dot(&b).unwrap();
    assert_eq!(c.values(), vec![58.0, 64.0, 139.0, 154.0]);
    assert!(matches!(a.dot(&a), Err(ConvError::Shape(_))));
}

#[test]
fn test_masked_dot_skips_terms() {
    let mut a = matrix!([[1.0, 2.0], [3.0, 4.0]]);
    a.set_mask();
    a.set_column_mask(1, true).unwrap();
    let b = matrix!([[1.0, 1.0], [1.0, 1.0]]);
    assert_eq!(a.dot(&b).unwrap().values(), vec![1.0, 1.0, 3.0, 3.0]);
}

#[test]
fn test_scaling_constant_multiplies_results() {
    let mut a = matrix!([[1.0, 2.0], [3.0, 4.0]]);
    a.set_scaling_constant(2.0);
    assert_eq!(a.apply(|x| x + 1.0).values(), vec![4.0, 6.0, 8.0, 10.0]);
    assert_eq!(a.add(&Matrix::constant(2, 2, 1.0)).unwrap().values(), vec![4.0, 6.0, 8.0, 10.0]);
    assert_eq!(a.dot(&matrix!([[1.0], [1.0]])).unwrap().values(), vec![6.0, 14.0]);
    a.unset_scaling_constant();
    assert_eq!(a.multiply_constant(3.0).values(), vec![3.0, 6.0, 9.0, 12.0]);
}

#[test]
fn test_apply_bi_unites_masks() {
    let mut a = Matrix::constant(2, 2, 1.0);
    a.set_mask();
    a.set_mask_at(0, 0, true).unwrap();
    let mut b = Matrix::constant(2, 2, 2.0);
    b.set_mask();
    b.set_mask_at(1, 1, true).unwrap();

    let c = a.add(&b).unwrap();
    assert_eq!(c.values(), vec![0.0, 3.0, 3.0, 0.0]);
    assert!(c.is_masked(0, 0) && c.is_masked(1, 1));
    assert!(matches!(a.add(&Matrix::new(3, 2)), Err(ConvError::Shape(_))));
}

#[test]
fn test_max_and_min_keep_first_tie() {
    let m = matrix!([[1.0, 7.0], [7.0, -2.0], [-2.0, 0.0]]);
    assert_eq!(m.max(), Some((7.0, 0, 1)));
    assert_eq!(m.min(), Some((-2.0, 1, 1)));
    assert_eq!(m.variance(), m.apply(|x| (x - m.mean()).powi(2)).mean());
}

#[test]
fn test_duplicate_gets_new_identity() {
    let m = Matrix::new(1, 1);
    assert_eq!(m.clone().id(), m.id());
    assert_ne!(m.duplicate().id(), m.id());
}
