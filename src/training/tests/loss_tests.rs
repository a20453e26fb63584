//! Tests for loss functions

use anyhow::Result;
use approx::assert_relative_eq;
use candle_core::{Tensor, Var};
use proptest::prelude::*;
use test_case::test_case;

use crate::training::loss::{
    am_logits, correct_predictions, cross_entropy, margin_cross_entropy, orthogonality_loss,
};

use super::test_utils::{assert_tensor_close, create_test_device};

fn four_sample_batch() -> Result<(Tensor, Tensor)> {
    let device = create_test_device();
    let labels = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 0.0], [0.0, 1.0]], &device)?;
    let logits = Tensor::new(&[[0.8f32, 0.1], [0.3, 0.6], [-0.2, 0.4], [0.6, 0.4]], &device)?;
    Ok((labels, logits))
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_scalar::<f32>()?)
}

#[test]
fn zero_margin_unit_scale_equals_cross_entropy() -> Result<()> {
    let (labels, logits) = four_sample_batch()?;
    let margin = scalar(&margin_cross_entropy(&labels, &logits, 0.0, 1.0)?)?;
    let plain = scalar(&cross_entropy(&labels, &logits)?)?;
    assert_relative_eq!(margin, plain, epsilon = 1e-6);
    Ok(())
}

#[test]
fn separable_batch_margin_loss_matches_cross_entropy() -> Result<()> {
    let device = create_test_device();
    let labels = Tensor::new(&[[1f32, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]], &device)?;
    let logits = Tensor::new(&[[2f32, 1.0], [3.0, 0.0], [1.0, 2.0], [0.0, 3.0]], &device)?;
    let margin = scalar(&margin_cross_entropy(&labels, &logits, 0.0, 1.0)?)?;
    let plain = scalar(&cross_entropy(&labels, &logits)?)?;
    // mean of ln(1 + e^-1) and ln(1 + e^-3), each seen twice
    let expected = ((1.0 + (-1f32).exp()).ln() + (1.0 + (-3f32).exp()).ln()) / 2.0;
    assert_relative_eq!(margin, plain, epsilon = 1e-6);
    assert_relative_eq!(margin, expected, epsilon = 1e-5);
    assert_relative_eq!(margin, 0.180_924_5, epsilon = 1e-5);
    Ok(())
}

#[test]
fn cross_entropy_matches_hand_computation() -> Result<()> {
    let device = create_test_device();
    let labels = Tensor::new(&[[0f32, 1.0]], &device)?;
    let logits = Tensor::new(&[[0f32, 0.0]], &device)?;
    assert_relative_eq!(scalar(&cross_entropy(&labels, &logits)?)?, 2f32.ln(), epsilon = 1e-6);
    Ok(())
}

#[test]
fn am_logits_shift_only_true_class() -> Result<()> {
    let (labels, logits) = four_sample_batch()?;
    let shifted = am_logits(&labels, &logits, 0.1, 10.0)?;
    let expected = Tensor::new(
        &[[7.0f32, 1.0], [3.0, 5.0], [-3.0, 4.0], [6.0, 3.0]],
        &create_test_device(),
    )?;
    assert_tensor_close(&shifted, &expected, 1e-5)
}

#[test_case(0.05 ; "small margin")]
#[test_case(0.1 ; "default margin")]
#[test_case(0.35 ; "large margin")]
fn positive_margin_raises_loss(m: f64) -> Result<()> {
    let (labels, logits) = four_sample_batch()?;
    let base = scalar(&margin_cross_entropy(&labels, &logits, 0.0, 10.0)?)?;
    let with_margin = scalar(&margin_cross_entropy(&labels, &logits, m, 10.0)?)?;
    assert!(with_margin > base);
    Ok(())
}

#[test]
fn mismatched_shapes_are_rejected() -> Result<()> {
    let device = create_test_device();
    let labels = Tensor::new(&[[1f32, 0.0, 0.0]], &device)?;
    let logits = Tensor::new(&[[1f32, 0.0]], &device)?;
    assert!(cross_entropy(&labels, &logits).is_err());
    Ok(())
}

#[test]
fn orthonormal_centroids_have_zero_loss() -> Result<()> {
    let device = create_test_device();
    let encodings = Tensor::new(&[[1f32, 0.0, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]], &device)?;
    let labels = Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 0.0]], &device)?;
    assert_relative_eq!(scalar(&orthogonality_loss(&encodings, &labels)?)?, 0.0, epsilon = 1e-6);
    Ok(())
}

#[test]
fn parallel_centroids_are_penalised() -> Result<()> {
    let device = create_test_device();
    let encodings = Tensor::new(&[[1f32, 0.0], [1.0, 0.0]], &device)?;
    let labels = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
    // Gram matrix is all ones, so only the two off-diagonal cells count.
    assert_relative_eq!(scalar(&orthogonality_loss(&encodings, &labels)?)?, 2.0, epsilon = 1e-6);
    Ok(())
}

#[test_case([[2.0, 0.0], [0.0, 0.5]], 9.5625 ; "orthogonal but not unit length")]
#[test_case([[1.0, 0.0], [0.6, 0.8]], 0.72 ; "unit length but not orthogonal")]
fn non_orthonormal_centroids_are_penalised(rows: [[f32; 2]; 2], expected: f32) -> Result<()> {
    let device = create_test_device();
    let encodings = Tensor::new(&rows, &device)?;
    let labels = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
    let loss = scalar(&orthogonality_loss(&encodings, &labels)?)?;
    assert!(loss > 0.0);
    assert_relative_eq!(loss, expected, epsilon = 1e-5);
    Ok(())
}

#[test]
fn single_class_penalises_centroid_norm() -> Result<()> {
    let device = create_test_device();
    let encodings = Tensor::new(&[[0.6f32, 0.0], [0.4, 0.0]], &device)?;
    let labels = Tensor::new(&[[0f32, 1.0], [0.0, 1.0]], &device)?;
    // Centroid (0.5, 0): (0.25 - 1)^2.
    assert_relative_eq!(scalar(&orthogonality_loss(&encodings, &labels)?)?, 0.5625, epsilon = 1e-6);
    Ok(())
}

#[test]
fn soft_labels_group_by_arg_max() -> Result<()> {
    let device = create_test_device();
    let encodings = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
    let hard = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
    let soft = Tensor::new(&[[0.7f32, 0.3], [0.45, 0.55]], &device)?;
    assert_relative_eq!(
        scalar(&orthogonality_loss(&encodings, &soft)?)?,
        scalar(&orthogonality_loss(&encodings, &hard)?)?,
        epsilon = 1e-6
    );
    Ok(())
}

#[test]
fn orthogonality_gradient_reaches_encodings() -> Result<()> {
    let device = create_test_device();
    let encodings = Var::new(&[[1f32, 0.5], [0.5, 1.0]], &device)?;
    let labels = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &device)?;
    let loss = orthogonality_loss(encodings.as_tensor(), &labels)?;
    let grads = loss.backward()?;
    let grad = grads
        .get(encodings.as_tensor())
        .ok_or_else(|| anyhow::anyhow!("no gradient for encodings"))?;
    let norm = grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
    assert!(norm > 0.0);
    Ok(())
}

#[test]
fn correct_predictions_counts_arg_max_hits() -> Result<()> {
    let (labels, logits) = four_sample_batch()?;
    // Rows 0 and 1 hit, rows 2 and 3 miss.
    assert_eq!(correct_predictions(&labels, &logits)?, 2);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_orthogonality_loss_is_non_negative(
        values in proptest::collection::vec(-2.0f32..2.0, 12),
        classes in proptest::collection::vec(0usize..3, 4),
    ) {
        let device = create_test_device();
        let encodings = Tensor::from_vec(values, (4, 3), &device).unwrap();
        let mut one_hot = vec![0f32; 12];
        for (row, class) in classes.iter().enumerate() {
            one_hot[row * 3 + class] = 1.0;
        }
        let labels = Tensor::from_vec(one_hot, (4, 3), &device).unwrap();
        let loss = orthogonality_loss(&encodings, &labels).unwrap().to_scalar::<f32>().unwrap();
        prop_assert!(loss >= 0.0);
    }
}
