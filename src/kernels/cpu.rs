//! CPU bodies of every kernel, executed group by group.
//!
//! Groups are independent and run in parallel on the rayon pool; each group
//! owns the slice of the output it writes. Kernels with barriers run their
//! threads through a [`WorkGroup`] so the reduction structure is the same one
//! the WGSL shaders execute.
//!
//! Cursor-derived offsets (layer, position, cache offset) are only known at
//! launch time, so those are range-checked here and reported as
//! [`EngineError::Bounds`] instead of indexing out of range.

use rayon::prelude::*;

use super::spmd::WorkGroup;
use super::AttentionDims;
use crate::error::{EngineError, EngineResult};
use crate::layout::ThreadLayout;

fn out_of_range(kernel: &str, buffer: &str, required: usize, actual: usize) -> EngineError {
    EngineError::Bounds {
        buffer: buffer.to_string(),
        kernel: kernel.to_string(),
        required,
        actual,
    }
}

/// Partial sums of squares, one per group, into `reduce[group]`.
pub fn reduce_sum_squares(layout: &ThreadLayout, input: &[f32], reduce: &mut [f32], size: usize) {
    let n_groups = layout.num_groups() as usize;
    let group_size = layout.group_size;
    reduce[..n_groups]
        .par_iter_mut()
        .enumerate()
        .for_each(|(g, partial)| {
            let mut group = WorkGroup::new(g as u32, group_size);
            group.phase(|t, local| {
                let i = t.global as usize;
                local[t.local as usize] = if i < size { input[i] * input[i] } else { 0.0 };
            });
            *partial = group.tree_reduce(|a, b| a + b);
        });
}

/// Single thread: fold the partials and store the normalization scale in `reduce[0]`.
pub fn finish_rms_norm(reduce: &mut [f32], partials: usize, size: usize, eps: f32) {
    let mut sum = 0.0f32;
    for partial in &reduce[..partials] {
        sum += *partial;
    }
    reduce[0] = 1.0 / (sum / size as f32 + eps).sqrt();
}

#[allow(clippy::too_many_arguments)]
pub fn apply_rms_norm(
    layout: &ThreadLayout,
    out: &mut [f32],
    input: &[f32],
    weight: &[f32],
    scale: f32,
    layer: usize,
    size: usize,
) -> EngineResult<()> {
    let offset = layer * size;
    if offset + size > weight.len() {
        return Err(out_of_range("apply_rms_norm", "weight", offset + size, weight.len()));
    }
    let weight = &weight[offset..offset + size];
    let group_size = layout.group_size as usize;
    out[..size]
        .par_chunks_mut(group_size)
        .enumerate()
        .for_each(|(g, chunk)| {
            for (local, o) in chunk.iter_mut().enumerate() {
                let i = g * group_size + local;
                *o = weight[i] * (scale * input[i]);
            }
        });
    Ok(())
}

/// One thread per output row; the dot product is sequential per thread.
#[allow(clippy::too_many_arguments)]
pub fn matvec(
    layout: &ThreadLayout,
    out: &mut [f32],
    input: &[f32],
    weight: &[f32],
    layer: usize,
    in_dim: usize,
    out_dim: usize,
) -> EngineResult<()> {
    let offset = layer * out_dim * in_dim;
    let end = offset + out_dim * in_dim;
    if end > weight.len() {
        return Err(out_of_range("matvec", "weight", end, weight.len()));
    }
    let weight = &weight[offset..end];
    let input = &input[..in_dim];
    let group_size = layout.group_size as usize;
    out[..out_dim]
        .par_chunks_mut(group_size)
        .enumerate()
        .for_each(|(g, chunk)| {
            for (local, o) in chunk.iter_mut().enumerate() {
                let row = g * group_size + local;
                let w = &weight[row * in_dim..(row + 1) * in_dim];
                let mut acc = 0.0f32;
                for j in 0..in_dim {
                    acc += w[j] * input[j];
                }
                *o = acc;
            }
        });
    Ok(())
}

fn layer_slice<'w>(
    kernel: &str,
    buffer: &str,
    weight: &'w [f32],
    layer: usize,
    per_layer: usize,
) -> EngineResult<&'w [f32]> {
    let offset = layer * per_layer;
    let end = offset + per_layer;
    if end > weight.len() {
        return Err(out_of_range(kernel, buffer, end, weight.len()));
    }
    Ok(&weight[offset..end])
}

/// Strided partial dot product of one row, combined by the group's tree.
fn group_dot(group: &mut WorkGroup, row: &[f32], input: &[f32]) -> f32 {
    let stride = group.size() as usize;
    group.phase(|t, local| {
        let mut acc = 0.0f32;
        let mut j = t.local as usize;
        while j < input.len() {
            acc += row[j] * input[j];
            j += stride;
        }
        local[t.local as usize] = acc;
    });
    group.tree_reduce(|a, b| a + b)
}

/// One group per output row.
#[allow(clippy::too_many_arguments)]
pub fn row_matvec(
    layout: &ThreadLayout,
    out: &mut [f32],
    input: &[f32],
    weight: &[f32],
    layer: usize,
    in_dim: usize,
    out_dim: usize,
    accumulate: bool,
) -> EngineResult<()> {
    let weight = layer_slice("row_matvec", "weight", weight, layer, in_dim * out_dim)?;
    let input = &input[..in_dim];
    let group_size = layout.group_size;
    out[..out_dim]
        .par_iter_mut()
        .enumerate()
        .for_each(|(row, o)| {
            let mut group = WorkGroup::new(row as u32, group_size);
            let dot = group_dot(&mut group, &weight[row * in_dim..(row + 1) * in_dim], input);
            if accumulate {
                *o += dot;
            } else {
                *o = dot;
            }
        });
    Ok(())
}

/// One group per hidden row: both projections, then the gate.
#[allow(clippy::too_many_arguments)]
pub fn fused_swiglu(
    layout: &ThreadLayout,
    out: &mut [f32],
    input: &[f32],
    w1: &[f32],
    w3: &[f32],
    layer: usize,
    in_dim: usize,
    hidden: usize,
) -> EngineResult<()> {
    let w1 = layer_slice("fused_swiglu", "w1", w1, layer, in_dim * hidden)?;
    let w3 = layer_slice("fused_swiglu", "w3", w3, layer, in_dim * hidden)?;
    let input = &input[..in_dim];
    let group_size = layout.group_size;
    out[..hidden]
        .par_iter_mut()
        .enumerate()
        .for_each(|(row, o)| {
            let mut group = WorkGroup::new(row as u32, group_size);
            let rows = row * in_dim..(row + 1) * in_dim;
            let gate = group_dot(&mut group, &w1[rows.clone()], input);
            let up = group_dot(&mut group, &w3[rows], input);
            *o = silu_scalar(gate) * up;
        });
    Ok(())
}

#[inline]
fn rotate_pair(v: &mut [f32], at: usize, cos: f32, sin: f32) {
    let v0 = v[at];
    let v1 = v[at + 1];
    v[at] = v0 * cos - v1 * sin;
    v[at + 1] = v0 * sin + v1 * cos;
}

/// Rotation angle of pair `pair` at `position`.
#[inline]
pub fn rope_angle(pair: usize, position: usize, head_size: usize, theta: f32) -> (f32, f32) {
    let head_dim = (2 * pair) % head_size;
    let freq = 1.0 / theta.powf(head_dim as f32 / head_size as f32);
    let angle = position as f32 * freq;
    (angle.cos(), angle.sin())
}

#[allow(clippy::too_many_arguments)]
pub fn rope(
    layout: &ThreadLayout,
    q: &mut [f32],
    k: &mut [f32],
    position: usize,
    dim: usize,
    kv_dim: usize,
    head_size: usize,
    theta: f32,
) {
    let pairs = dim / 2;
    let group_size = layout.group_size as usize;
    let span = 2 * group_size;
    let n_chunks = dim.div_ceil(span);
    let mut k_chunks: Vec<&mut [f32]> = k[..kv_dim].chunks_mut(span).collect();
    k_chunks.resize_with(n_chunks, Default::default);

    q[..dim]
        .par_chunks_mut(span)
        .zip(k_chunks.into_par_iter())
        .enumerate()
        .for_each(|(g, (qc, kc))| {
            for local in 0..group_size {
                let pair = g * group_size + local;
                if pair >= pairs {
                    break;
                }
                let (cos, sin) = rope_angle(pair, position, head_size, theta);
                rotate_pair(qc, 2 * local, cos, sin);
                if 2 * pair < kv_dim {
                    rotate_pair(kc, 2 * local, cos, sin);
                }
            }
        });
}

pub fn cache_write(
    layout: &ThreadLayout,
    cache: &mut [f32],
    src: &[f32],
    offset: usize,
    kv_dim: usize,
) -> EngineResult<()> {
    if offset + kv_dim > cache.len() {
        return Err(out_of_range("cache_write", "cache", offset + kv_dim, cache.len()));
    }
    let group_size = layout.group_size as usize;
    cache[offset..offset + kv_dim]
        .par_chunks_mut(group_size)
        .enumerate()
        .for_each(|(g, chunk)| {
            let base = g * group_size;
            chunk.copy_from_slice(&src[base..base + chunk.len()]);
        });
    Ok(())
}

fn check_window(kernel: &str, dims: &AttentionDims, position: usize) -> EngineResult<usize> {
    let ctx = dims.context_length as usize;
    if position >= ctx {
        return Err(out_of_range(kernel, "att", position + 1, ctx));
    }
    Ok(position)
}

fn layer_offset(kernel: &str, dims: &AttentionDims, layer: usize, cache_len: usize) -> EngineResult<usize> {
    let stride = dims.context_length as usize * dims.kv_dim as usize;
    let offset = layer * stride;
    if offset + stride > cache_len {
        return Err(out_of_range(kernel, "cache", offset + stride, cache_len));
    }
    Ok(offset)
}

/// Scores for `t in [0, position]`, strided across the threads of each head's group.
pub fn attention_scores(
    layout: &ThreadLayout,
    att: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    position: usize,
    layer: usize,
    dims: &AttentionDims,
) -> EngineResult<()> {
    let last = check_window("attention_scores", dims, position)?;
    let loff = layer_offset("attention_scores", dims, layer, key_cache.len())?;
    let ctx = dims.context_length as usize;
    let hs = dims.head_size as usize;
    let kv_dim = dims.kv_dim as usize;
    let kv_mul = dims.kv_mul as usize;
    let scale = (hs as f32).sqrt();
    let group_size = layout.group_size;

    att.par_chunks_mut(ctx)
        .take(dims.n_heads as usize)
        .enumerate()
        .for_each(|(h, row)| {
            let qh = &q[h * hs..(h + 1) * hs];
            let kv_head = h / kv_mul;
            let mut group = WorkGroup::new(h as u32, group_size);
            group.phase(|thread, _| {
                let mut t = thread.local as usize;
                while t <= last {
                    let kt = &key_cache[loff + t * kv_dim + kv_head * hs..][..hs];
                    let mut score = 0.0f32;
                    for i in 0..hs {
                        score += qh[i] * kt[i];
                    }
                    row[t] = score / scale;
                    t += group_size as usize;
                }
            });
        });
    Ok(())
}

pub fn attention_max(
    layout: &ThreadLayout,
    att: &[f32],
    att_max: &mut [f32],
    position: usize,
    dims: &AttentionDims,
) -> EngineResult<()> {
    let last = check_window("attention_max", dims, position)?;
    let ctx = dims.context_length as usize;
    let group_size = layout.group_size;
    att_max[..dims.n_heads as usize]
        .par_iter_mut()
        .enumerate()
        .for_each(|(h, max)| {
            let row = &att[h * ctx..(h + 1) * ctx];
            let mut group = WorkGroup::new(h as u32, group_size);
            group.phase(|thread, local| {
                let mut m = f32::NEG_INFINITY;
                let mut t = thread.local as usize;
                while t <= last {
                    m = m.max(row[t]);
                    t += group_size as usize;
                }
                local[thread.local as usize] = m;
            });
            *max = group.tree_reduce(f32::max);
        });
    Ok(())
}

/// Exponentials are written back into `att`; the per-head sum goes to `att_sum`.
pub fn attention_exp_sum(
    layout: &ThreadLayout,
    att: &mut [f32],
    att_max: &[f32],
    att_sum: &mut [f32],
    position: usize,
    dims: &AttentionDims,
) -> EngineResult<()> {
    let last = check_window("attention_exp_sum", dims, position)?;
    let ctx = dims.context_length as usize;
    let group_size = layout.group_size;
    att.par_chunks_mut(ctx)
        .zip(att_sum.par_iter_mut())
        .take(dims.n_heads as usize)
        .enumerate()
        .for_each(|(h, (row, sum))| {
            let max = att_max[h];
            let mut group = WorkGroup::new(h as u32, group_size);
            group.phase(|thread, local| {
                let mut partial = 0.0f32;
                let mut t = thread.local as usize;
                while t <= last {
                    let e = (row[t] - max).exp();
                    row[t] = e;
                    partial += e;
                    t += group_size as usize;
                }
                local[thread.local as usize] = partial;
            });
            *sum = group.tree_reduce(|a, b| a + b);
        });
    Ok(())
}

/// Normalizes the head's weights, then accumulates values over the window.
#[allow(clippy::too_many_arguments)]
pub fn attention_weighted_sum(
    layout: &ThreadLayout,
    out: &mut [f32],
    att: &mut [f32],
    att_sum: &[f32],
    value_cache: &[f32],
    position: usize,
    layer: usize,
    dims: &AttentionDims,
) -> EngineResult<()> {
    let last = check_window("attention_weighted_sum", dims, position)?;
    let loff = layer_offset("attention_weighted_sum", dims, layer, value_cache.len())?;
    let ctx = dims.context_length as usize;
    let hs = dims.head_size as usize;
    let kv_dim = dims.kv_dim as usize;
    let kv_mul = dims.kv_mul as usize;
    let group_size = layout.group_size;
    let stride = group_size as usize;

    att.par_chunks_mut(ctx)
        .zip(out.par_chunks_mut(hs))
        .take(dims.n_heads as usize)
        .enumerate()
        .for_each(|(h, (row, out_h))| {
            let sum = att_sum[h];
            let kv_head = h / kv_mul;
            let mut group = WorkGroup::new(h as u32, group_size);
            group.phase(|thread, _| {
                let mut t = thread.local as usize;
                while t <= last {
                    row[t] /= sum;
                    t += stride;
                }
            });
            group.phase(|thread, _| {
                let mut i = thread.local as usize;
                while i < hs {
                    let mut acc = 0.0f32;
                    for (t, weight) in row[..=last].iter().enumerate() {
                        acc += weight * value_cache[loff + t * kv_dim + kv_head * hs + i];
                    }
                    out_h[i] = acc;
                    i += stride;
                }
            });
        });
    Ok(())
}

/// One thread per head: scores, softmax and weighted sum in sequence, with
/// the head's row of `att` as scratch.
#[allow(clippy::too_many_arguments)]
pub fn attention_heads(
    out: &mut [f32],
    att: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    position: usize,
    layer: usize,
    dims: &AttentionDims,
) -> EngineResult<()> {
    let last = check_window("attention_heads", dims, position)?;
    let loff = layer_offset("attention_heads", dims, layer, key_cache.len())?;
    layer_offset("attention_heads", dims, layer, value_cache.len())?;
    let ctx = dims.context_length as usize;
    let hs = dims.head_size as usize;
    let kv_dim = dims.kv_dim as usize;
    let kv_mul = dims.kv_mul as usize;
    let scale = (hs as f32).sqrt();

    att.par_chunks_mut(ctx)
        .zip(out.par_chunks_mut(hs))
        .take(dims.n_heads as usize)
        .enumerate()
        .for_each(|(h, (row, out_h))| {
            let qh = &q[h * hs..(h + 1) * hs];
            let head = loff + (h / kv_mul) * hs;
            let mut max = f32::NEG_INFINITY;
            for (t, score) in row[..=last].iter_mut().enumerate() {
                let kt = &key_cache[head + t * kv_dim..][..hs];
                let mut dot = 0.0f32;
                for i in 0..hs {
                    dot += qh[i] * kt[i];
                }
                *score = dot / scale;
                max = max.max(*score);
            }
            let mut sum = 0.0f32;
            for score in &mut row[..=last] {
                *score = (*score - max).exp();
                sum += *score;
            }
            for (i, o) in out_h.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (t, weight) in row[..=last].iter().enumerate() {
                    acc += weight * value_cache[head + t * kv_dim + i];
                }
                *o = acc / sum;
            }
        });
    Ok(())
}

/// One group per head. Each tile of `group_size` positions is scored into
/// group-local memory, then folded into the running max, sum and output
/// with the online-softmax correction. On the GPU thread `l` owns output
/// lanes `l, l + group_size, ..`; lanes are independent so they run in order here.
#[allow(clippy::too_many_arguments)]
pub fn flash_attention(
    layout: &ThreadLayout,
    out: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    position: usize,
    layer: usize,
    dims: &AttentionDims,
) -> EngineResult<()> {
    let last = check_window("flash_attention", dims, position)?;
    let loff = layer_offset("flash_attention", dims, layer, key_cache.len())?;
    layer_offset("flash_attention", dims, layer, value_cache.len())?;
    let hs = dims.head_size as usize;
    let kv_dim = dims.kv_dim as usize;
    let kv_mul = dims.kv_mul as usize;
    let scale = (hs as f32).sqrt();
    let group_size = layout.group_size;
    let tile = group_size as usize;

    out.par_chunks_mut(hs)
        .take(dims.n_heads as usize)
        .enumerate()
        .for_each(|(h, out_h)| {
            let qh = &q[h * hs..(h + 1) * hs];
            let head = loff + (h / kv_mul) * hs;
            let mut group = WorkGroup::new(h as u32, group_size);
            let mut running_max = f32::NEG_INFINITY;
            let mut running_sum = 0.0f32;
            out_h.fill(0.0);

            let mut base = 0;
            while base <= last {
                let valid = (last + 1 - base).min(tile);
                group.phase(|t, local| {
                    let l = t.local as usize;
                    if l < valid {
                        let kt = &key_cache[head + (base + l) * kv_dim..][..hs];
                        let mut dot = 0.0f32;
                        for i in 0..hs {
                            dot += qh[i] * kt[i];
                        }
                        local[l] = dot / scale;
                    }
                });
                let scores = &group.local()[..valid];
                let tile_max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let new_max = running_max.max(tile_max);
                let correction = (running_max - new_max).exp();
                let mut tile_sum = 0.0f32;
                for &s in scores {
                    tile_sum += (s - new_max).exp();
                }
                running_sum = running_sum * correction + tile_sum;
                running_max = new_max;

                for (i, o) in out_h.iter_mut().enumerate() {
                    let mut acc = *o * correction;
                    for (j, &s) in scores.iter().enumerate() {
                        acc += (s - new_max).exp() * value_cache[head + (base + j) * kv_dim + i];
                    }
                    *o = acc;
                }
                base += tile;
            }
            for o in out_h.iter_mut() {
                *o /= running_sum;
            }
        });
    Ok(())
}

fn elementwise<F>(layout: &ThreadLayout, out: &mut [f32], len: usize, body: F)
where
    F: Fn(usize, &mut f32) + Sync,
{
    let group_size = layout.group_size as usize;
    out[..len]
        .par_chunks_mut(group_size)
        .enumerate()
        .for_each(|(g, chunk)| {
            for (local, o) in chunk.iter_mut().enumerate() {
                body(g * group_size + local, o);
            }
        });
}

pub fn add_in_place(layout: &ThreadLayout, out: &mut [f32], input: &[f32], len: usize) {
    elementwise(layout, out, len, |i, o| *o += input[i]);
}

pub fn mul_in_place(layout: &ThreadLayout, out: &mut [f32], input: &[f32], len: usize) {
    elementwise(layout, out, len, |i, o| *o *= input[i]);
}

#[inline]
pub fn silu_scalar(v: f32) -> f32 {
    v / (1.0 + (-v).exp())
}

pub fn silu(layout: &ThreadLayout, data: &mut [f32], len: usize) {
    elementwise(layout, data, len, |_, o| *o = silu_scalar(*o));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rms_norm_three_kernels() {
        let x: Vec<f32> = (0..16).map(|i| i as f32 - 7.5).collect();
        let w: Vec<f32> = (0..16).map(|i| 1.0 + i as f32 * 0.1).collect();
        let layout = ThreadLayout::linear(16, 4);
        let mut reduce = vec![0.0; 4];
        reduce_sum_squares(&layout, &x, &mut reduce, 16);
        finish_rms_norm(&mut reduce, 4, 16, 1e-5);

        let ss: f32 = x.iter().map(|v| v * v).sum();
        let expected_scale = 1.0 / (ss / 16.0 + 1e-5).sqrt();
        assert!((reduce[0] - expected_scale).abs() < 1e-6);

        let mut out = vec![0.0; 16];
        apply_rms_norm(&layout, &mut out, &x, &w, reduce[0], 0, 16).unwrap();
        for i in 0..16 {
            assert!((out[i] - w[i] * expected_scale * x[i]).abs() < 1e-5);
        }
    }

    #[test]
    fn ragged_last_group_is_bounds_checked() {
        let x = vec![1.0f32; 10];
        let layout = ThreadLayout::linear(10, 4);
        let mut reduce = vec![0.0; 3];
        reduce_sum_squares(&layout, &x, &mut reduce, 10);
        assert_eq!(reduce, vec![4.0, 4.0, 2.0]);
    }

    #[test]
    fn matvec_selects_layer_slice() {
        // two layers of a 2x3 matrix
        let weight: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let input = [1.0, 0.0, 2.0];
        let mut out = [0.0; 2];
        matvec(&ThreadLayout::linear(2, 64), &mut out, &input, &weight, 1, 3, 2).unwrap();
        assert_eq!(out, [6.0 + 16.0, 9.0 + 22.0]);

        let err = matvec(&ThreadLayout::linear(2, 64), &mut out, &input, &weight, 2, 3, 2);
        assert!(matches!(err, Err(EngineError::Bounds { .. })));
    }

    #[test]
    fn rope_at_position_zero_is_identity() {
        let mut q: Vec<f32> = (0..8).map(|v| v as f32).collect();
        let mut k: Vec<f32> = (0..4).map(|v| v as f32).collect();
        let (q0, k0) = (q.clone(), k.clone());
        rope(&ThreadLayout::linear(4, 2), &mut q, &mut k, 0, 8, 4, 4, 10000.0);
        assert_eq!(q, q0);
        assert_eq!(k, k0);
    }

    #[test]
    fn rope_preserves_pair_norms() {
        let mut q: Vec<f32> = (0..8).map(|v| v as f32 + 1.0).collect();
        let mut k = vec![1.0f32; 4];
        let q0 = q.clone();
        rope(&ThreadLayout::linear(4, 1), &mut q, &mut k, 5, 8, 4, 4, 10000.0);
        for p in 0..4 {
            let before = q0[2 * p].hypot(q0[2 * p + 1]);
            let after = q[2 * p].hypot(q[2 * p + 1]);
            assert!((before - after).abs() < 1e-4);
        }
        assert!((k[0].hypot(k[1]) - 2f32.sqrt()).abs() < 1e-5);
    }

    #[test]
    fn cache_write_rejects_offset_past_end() {
        let mut cache = vec![0.0; 8];
        let src = [1.0, 2.0, 3.0, 4.0];
        cache_write(&ThreadLayout::linear(4, 2), &mut cache, &src, 4, 4).unwrap();
        assert_eq!(&cache[4..], &src);
        assert!(cache_write(&ThreadLayout::linear(4, 2), &mut cache, &src, 6, 4).is_err());
    }

    #[test]
    fn row_matvec_matches_per_thread_matvec() {
        let weight: Vec<f32> = (0..2 * 5 * 3).map(|v| (v as f32 * 0.37).sin()).collect();
        let input = [0.5, -1.0, 2.0, 0.25, 1.5];
        let mut expected = [0.0; 3];
        matvec(&ThreadLayout::linear(3, 64), &mut expected, &input, &weight, 1, 5, 3).unwrap();

        let mut out = [0.0; 3];
        row_matvec(&ThreadLayout::groups(3, 4), &mut out, &input, &weight, 1, 5, 3, false).unwrap();
        for (a, b) in out.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5);
        }

        let mut residual = [1.0, 2.0, 3.0];
        row_matvec(&ThreadLayout::groups(3, 2), &mut residual, &input, &weight, 1, 5, 3, true).unwrap();
        for i in 0..3 {
            assert!((residual[i] - (i as f32 + 1.0 + expected[i])).abs() < 1e-5);
        }
        let err = row_matvec(&ThreadLayout::groups(3, 4), &mut out, &input, &weight, 2, 5, 3, false);
        assert!(matches!(err, Err(EngineError::Bounds { .. })));
    }

    #[test]
    fn fused_swiglu_gates_first_projection() {
        // rows: w1 = [1, 0], w3 = [0, 1]
        let w1 = [1.0, 0.0, 0.0, 2.0];
        let w3 = [0.0, 1.0, 3.0, 0.0];
        let input = [1.0, -2.0];
        let mut out = [0.0; 2];
        fused_swiglu(&ThreadLayout::groups(2, 2), &mut out, &input, &w1, &w3, 0, 2, 2).unwrap();
        assert!((out[0] - silu_scalar(1.0) * -2.0).abs() < 1e-6);
        assert!((out[1] - silu_scalar(-4.0) * 3.0).abs() < 1e-6);
    }

    fn attention_case() -> (AttentionDims, Vec<f32>, Vec<f32>, Vec<f32>) {
        let dims = AttentionDims {
            n_heads: 2,
            head_size: 4,
            kv_dim: 4,
            kv_mul: 2,
            context_length: 8,
            n_layers: 1,
        };
        let q: Vec<f32> = (0..8).map(|v| (v as f32 * 0.7).cos()).collect();
        let keys: Vec<f32> = (0..32).map(|v| (v as f32 * 0.3).sin()).collect();
        let values: Vec<f32> = (0..32).map(|v| v as f32 * 0.1 - 1.0).collect();
        (dims, q, keys, values)
    }

    #[test]
    fn single_pass_attention_matches_staged_kernels() {
        let (dims, q, keys, values) = attention_case();
        let position = 6;
        let heads = ThreadLayout::groups(2, 4);
        let mut att = vec![0.0; 16];
        let (mut att_max, mut att_sum) = (vec![0.0; 2], vec![0.0; 2]);
        let mut staged = vec![0.0; 8];
        attention_scores(&heads, &mut att, &q, &keys, position, 0, &dims).unwrap();
        attention_max(&heads, &att, &mut att_max, position, &dims).unwrap();
        attention_exp_sum(&heads, &mut att, &att_max, &mut att_sum, position, &dims).unwrap();
        attention_weighted_sum(&heads, &mut staged, &mut att, &att_sum, &values, position, 0, &dims)
            .unwrap();

        let mut per_head = vec![0.0; 8];
        let mut scratch = vec![0.0; 16];
        attention_heads(&mut per_head, &mut scratch, &q, &keys, &values, position, 0, &dims).unwrap();

        // tiles of 4 split the 7 visible positions 4 + 3
        let mut flash = vec![f32::NAN; 8];
        flash_attention(&heads, &mut flash, &q, &keys, &values, position, 0, &dims).unwrap();

        for i in 0..8 {
            assert!((per_head[i] - staged[i]).abs() < 1e-5, "per-head lane {i}");
            assert!((flash[i] - staged[i]).abs() < 1e-5, "flash lane {i}");
        }
    }

    #[test]
    fn single_pass_attention_rejects_positions_outside_window() {
        let (dims, q, keys, values) = attention_case();
        let mut out = vec![0.0; 8];
        let err = flash_attention(&ThreadLayout::groups(2, 4), &mut out, &q, &keys, &values, 8, 0, &dims);
        assert!(matches!(err, Err(EngineError::Bounds { required: 9, actual: 8, .. })));
        let mut att = vec![0.0; 16];
        let err = attention_heads(&mut out, &mut att, &q, &keys, &values, 0, 1, &dims);
        assert!(matches!(err, Err(EngineError::Bounds { .. })));
    }

    #[test]
    fn silu_and_elementwise() {
        let layout = ThreadLayout::linear(3, 2);
        let mut a = vec![0.0, 1.0, -1.0];
        silu(&layout, &mut a, 3);
        assert_eq!(a[0], 0.0);
        assert!((a[1] - 0.731_058_6).abs() < 1e-6);

        let mut b = vec![1.0, 2.0, 3.0];
        add_in_place(&layout, &mut b, &[1.0, 1.0, 1.0], 3);
        mul_in_place(&layout, &mut b, &[2.0, 0.5, -1.0], 3);
        assert_eq!(b, vec![4.0, 1.5, -4.0]);
    }
}
