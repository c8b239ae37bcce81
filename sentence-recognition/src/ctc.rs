//! Connectionist temporal classification: loss and best-path decoding.
//!
//! The blank symbol is the last class, at index `vocab.len()`, which is also
//! the label padding value.

use candle_core::{D, IndexOp, Result, Tensor};

/// Log-space stand-in for an impossible transition. Finite so that
/// `x - max(x)` never produces NaN when every entry is masked.
const NEG_INF: f32 = -1e30;

/// Numerically stable `log(sum(exp(xs)))` over `dim`, removing that dim.
fn log_sum_exp(xs: &Tensor, dim: usize) -> Result<Tensor> {
    let max = xs.max_keepdim(dim)?.detach();
    let summed = xs.broadcast_sub(&max)?.exp()?.sum_keepdim(dim)?.log()?;
    (summed + max)?.squeeze(dim)
}

/// Shifts `alpha` right by `by` states along dim 1, filling with `NEG_INF`.
fn shift_states(alpha: &Tensor, by: usize) -> Result<Tensor> {
    let (batch, states) = alpha.dims2()?;
    let fill = Tensor::full(NEG_INF, (batch, by.min(states)), alpha.device())?;
    if by >= states {
        return Ok(fill);
    }
    Tensor::cat(&[&fill, &alpha.narrow(1, 0, states - by)?], 1)
}

/// Mean CTC negative log-likelihood.
///
/// `log_probs` is `(batch, time, classes)` log-softmax output, `labels` is
/// `(batch, max_len)` u32 padded with `blank`. Entries equal to `blank` are
/// not part of the target sequence.
pub fn ctc_loss(log_probs: &Tensor, labels: &Tensor, blank: u32) -> Result<Tensor> {
    let (batch, time, _classes) = log_probs.dims3()?;
    let device = log_probs.device();
    let labels = labels.to_vec2::<u32>()?;
    let max_len = labels.first().map_or(0, Vec::len);
    let states = 2 * max_len + 1;

    let mut extended = Vec::with_capacity(batch * states);
    let mut init_mask = Vec::with_capacity(batch * states);
    let mut skip_mask = Vec::with_capacity(batch * states);
    let mut final_mask = Vec::with_capacity(batch * states);

    for row in &labels {
        let target: Vec<u32> = row.iter().copied().filter(|&l| l != blank).collect();
        let ext: Vec<u32> = (0..states)
            .map(|s| {
                if s % 2 == 0 {
                    blank
                } else {
                    target.get(s / 2).copied().unwrap_or(blank)
                }
            })
            .collect();
        let last = 2 * target.len();

        for s in 0..states {
            let starts = s == 0 || (s == 1 && !target.is_empty());
            init_mask.push(if starts { 0.0 } else { NEG_INF });

            let can_skip = s >= 2 && ext[s] != blank && ext[s] != ext[s - 2];
            skip_mask.push(if can_skip { 0.0 } else { NEG_INF });

            let ends = s == last || (last > 0 && s == last - 1);
            final_mask.push(if ends { 0.0 } else { NEG_INF });
        }
        extended.extend(ext);
    }

    let extended = Tensor::from_vec(extended, (batch, 1, states), device)?
        .broadcast_as((batch, time, states))?
        .contiguous()?;
    let emissions = log_probs.gather(&extended, 2)?;
    let init_mask = Tensor::from_vec(init_mask, (batch, states), device)?;
    let skip_mask = Tensor::from_vec(skip_mask, (batch, states), device)?;
    let final_mask = Tensor::from_vec(final_mask, (batch, states), device)?;

    let mut alpha = (emissions.i((.., 0, ..))? + init_mask)?;
    for t in 1..time {
        let step = shift_states(&alpha, 1)?;
        let skip = (shift_states(&alpha, 2)? + &skip_mask)?;
        let paths = Tensor::stack(&[&alpha, &step, &skip], 0)?;
        alpha = (log_sum_exp(&paths, 0)? + emissions.i((.., t, ..))?)?;
    }

    let log_likelihood = log_sum_exp(&(alpha + final_mask)?, 1)?;
    log_likelihood.neg()?.mean_all()
}

/// Collapses repeats and drops blanks from a best-path index sequence.
pub fn collapse_path(path: &[u32], vocab: &[char]) -> String {
    let blank = vocab.len() as u32;
    let mut text = String::new();
    let mut previous = None;

    for &index in path {
        if Some(index) != previous && index != blank {
            if let Some(&c) = vocab.get(index as usize) {
                text.push(c);
            }
        }
        previous = Some(index);
    }

    text
}

/// Greedy decoding of `(batch, time, classes)` scores into strings.
pub fn greedy_decode(log_probs: &Tensor, vocab: &[char]) -> Result<Vec<String>> {
    let paths = log_probs.argmax(D::Minus1)?.to_vec2::<u32>()?;
    Ok(paths.iter().map(|path| collapse_path(path, vocab)).collect())
}
