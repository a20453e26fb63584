//! Loss functions of the AMCA objective
//!
//! All functions take labels first and work on `[batch, classes]` tensors.
//! Labels may be one-hot or soft (cutmix targets, softmax pseudo-labels).

use candle_core::{DType, Tensor, D};
use candle_nn as nn;

use crate::error::{Error, Result};

/// Mean softmax cross-entropy against (possibly soft) labels
pub fn cross_entropy(labels: &Tensor, logits: &Tensor) -> Result<Tensor> {
    check_pair(labels, logits)?;
    let log_probs = nn::ops::log_softmax(logits, D::Minus1)?;
    let labels = labels.to_dtype(log_probs.dtype())?;
    let per_sample = (labels * log_probs)?.sum(D::Minus1)?.neg()?;
    Ok(per_sample.mean_all()?)
}

/// Additive-margin logits: `s * (logits - m * labels)`
///
/// With one-hot labels this lowers only the true-class logit by `m`.
pub fn am_logits(labels: &Tensor, logits: &Tensor, m: f64, s: f64) -> Result<Tensor> {
    check_pair(labels, logits)?;
    let labels = labels.to_dtype(logits.dtype())?;
    let shifted = (logits - (labels * m)?)?;
    Ok((shifted * s)?)
}

/// Cross-entropy on additive-margin logits
pub fn margin_cross_entropy(labels: &Tensor, logits: &Tensor, m: f64, s: f64) -> Result<Tensor> {
    cross_entropy(labels, &am_logits(labels, logits, m, s)?)
}

/// Orthogonality loss over the class centroids present in a batch
///
/// Samples are grouped by the arg-max of their labels. Only classes that
/// occur in the batch get a centroid, so the Gram matrix is `k x k` with `k`
/// the number of distinct classes and every centroid averages at least one
/// encoding. Returns `sum((C C^T - I)^2)`.
pub fn orthogonality_loss(encodings: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (batch, _) = encodings.dims2()?;
    let (label_rows, _) = labels.dims2()?;
    if batch != label_rows {
        return Err(Error::invalid_input(format!(
            "{} encodings but {} label rows",
            batch, label_rows
        )));
    }
    if batch == 0 {
        return Ok(Tensor::zeros((), encodings.dtype(), encodings.device())?);
    }

    let classes = labels.argmax(D::Minus1)?.to_vec1::<u32>()?;
    let (slots, counts) = unique_with_counts(&classes);
    let k = counts.len();

    // Row j of `assign` averages the encodings of the j-th distinct class.
    let mut assign = vec![0f32; k * batch];
    for (sample, &slot) in slots.iter().enumerate() {
        assign[slot * batch + sample] = 1.0 / counts[slot] as f32;
    }
    let assign = Tensor::from_vec(assign, (k, batch), encodings.device())?
        .to_dtype(encodings.dtype())?;
    let centroids = assign.matmul(encodings)?;

    let gram = centroids.matmul(&centroids.t()?)?;
    let eye = identity(k, &gram)?;
    Ok((gram - eye)?.sqr()?.sum_all()?)
}

/// Distinct values in first-seen order: the slot of every element and the
/// count of every slot
fn unique_with_counts(values: &[u32]) -> (Vec<usize>, Vec<usize>) {
    let mut seen: Vec<u32> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();
    let slots = values
        .iter()
        .map(|v| match seen.iter().position(|s| s == v) {
            Some(slot) => {
                counts[slot] += 1;
                slot
            }
            None => {
                seen.push(*v);
                counts.push(1);
                seen.len() - 1
            }
        })
        .collect();
    (slots, counts)
}

fn identity(k: usize, like: &Tensor) -> Result<Tensor> {
    let mut values = vec![0f32; k * k];
    for i in 0..k {
        values[i * k + i] = 1.0;
    }
    Ok(Tensor::from_vec(values, (k, k), like.device())?.to_dtype(like.dtype())?)
}

/// Number of rows whose prediction arg-max equals the label arg-max
pub fn correct_predictions(labels: &Tensor, predictions: &Tensor) -> Result<usize> {
    check_pair(labels, predictions)?;
    let hits = labels
        .argmax(D::Minus1)?
        .eq(&predictions.argmax(D::Minus1)?)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()?;
    Ok(hits as usize)
}

fn check_pair(labels: &Tensor, logits: &Tensor) -> Result<()> {
    if labels.dims() != logits.dims() {
        return Err(Error::invalid_input(format!(
            "label shape {:?} does not match logit shape {:?}",
            labels.dims(),
            logits.dims()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_keeps_first_seen_order() {
        let (slots, counts) = unique_with_counts(&[3, 1, 3, 2, 1, 3]);
        assert_eq!(slots, vec![0, 1, 0, 2, 1, 0]);
        assert_eq!(counts, vec![3, 2, 1]);
    }
}
