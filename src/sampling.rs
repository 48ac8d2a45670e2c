//! Token selection over a logits row.

use std::cmp::Ordering;

/// Top-k selection, sorted by value descending.
#[derive(Debug, Clone, PartialEq)]
pub struct TopK {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

/// Index of the largest logit. Ties resolve to the lowest index; NaN never wins.
pub fn argmax(logits: &[f32]) -> u32 {
    let mut best = 0usize;
    let mut best_value = f32::NEG_INFINITY;
    for (i, &v) in logits.iter().enumerate() {
        if v > best_value {
            best = i;
            best_value = v;
        }
    }
    best as u32
}

pub fn top_k(logits: &[f32], k: usize) -> TopK {
    let k = k.min(logits.len());
    if k == 0 {
        return TopK {
            indices: Vec::new(),
            values: Vec::new(),
        };
    }
    let by_value_desc = |a: &(usize, f32), b: &(usize, f32)| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(Ordering::Equal)
            .then(a.0.cmp(&b.0))
    };
    let mut indexed: Vec<(usize, f32)> = logits.iter().copied().enumerate().collect();
    indexed.select_nth_unstable_by(k - 1, by_value_desc);
    indexed.truncate(k);
    indexed.sort_by(by_value_desc);

    TopK {
        indices: indexed.iter().map(|(i, _)| *i as u32).collect(),
        values: indexed.iter().map(|(_, v)| *v).collect(),
    }
}
