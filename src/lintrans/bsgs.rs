//! Baby-step/giant-step decomposition of diagonal linear transforms
//!
//! A block of a linear operator is stored as generalized diagonals: for a
//! slot vector x, the block computes
//!
//!   y[k] = Σ_d diag_d[k] · x[(k + d) mod n]
//!
//! which costs one rotation per non-zero diagonal. Writing every index as
//! d = g + b, with g a multiple of the baby-step size n1 and 0 ≤ b < n1, gives
//!
//!   y = Σ_g rot_g( Σ_b rot_{-g}(diag_{g+b}) ⊙ rot_b(x) )
//!
//! so only the distinct baby steps b rotate the input and only the distinct
//! giant steps g rotate partial sums. The diagonals are pre-rotated by -g at
//! encoding time, which is free because they are plaintext.
//!
//! `n1` is chosen as the smallest power of two whose giant/baby rotation
//! count ratio reaches the requested bound.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

/// Rotate a slot vector left by `k`: `out[i] = v[(i + k) mod n]`
pub fn rotate(v: &[f64], k: usize) -> Vec<f64> {
    let n = v.len();
    if n == 0 {
        return Vec::new();
    }
    let k = k % n;
    let mut out = Vec::with_capacity(n);
    out.extend_from_slice(&v[k..]);
    out.extend_from_slice(&v[..k]);
    out
}

/// Reference evaluation with one rotation per diagonal
pub fn apply_diagonals<'a, I>(diagonals: I, input: &[f64]) -> Vec<f64>
where
    I: IntoIterator<Item = (i64, &'a [f64])>,
{
    let n = input.len();
    let mut out = vec![0.0; n];
    for (idx, diag) in diagonals {
        let rotated = rotate(input, normalize_index(idx, n));
        for k in 0..n {
            out[k] += diag[k] * rotated[k];
        }
    }
    out
}

fn normalize_index(idx: i64, slots: usize) -> usize {
    idx.rem_euclid(slots as i64) as usize
}

/// Upper bound on giant/baby rotation ratio, as a power-of-two exponent.
///
/// The ratio is given as a plain number and converted with the natural log,
/// truncated toward zero.
pub fn log_ratio_bound(bsgs_ratio: f64) -> u32 {
    if bsgs_ratio <= 1.0 {
        0
    } else {
        bsgs_ratio.ln() as u32
    }
}

/// Giant step -> baby steps, plus the two rotation sets.
type BsgsIndex = (BTreeMap<usize, Vec<usize>>, BTreeSet<usize>, BTreeSet<usize>);

fn bsgs_index(diags: &[usize], n1: usize) -> BsgsIndex {
    let mut index: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    let mut giant = BTreeSet::new();
    let mut baby = BTreeSet::new();
    for &rot in diags {
        let g = (rot / n1) * n1;
        let b = rot % n1;
        let babies = index.entry(g).or_default();
        if !babies.contains(&b) {
            babies.push(b);
        }
        giant.insert(g);
        baby.insert(b);
    }
    (index, giant, baby)
}

fn find_baby_step(diags: &[usize], slots: usize, log_max_ratio: u32) -> usize {
    let max_ratio = (1u64 << log_max_ratio) as f64;
    let mut n1 = 1;
    while n1 < slots {
        let (_, giant, baby) = bsgs_index(diags, n1);
        let nb_giant = giant.len() as f64 - 1.0;
        let nb_baby = baby.len() as f64 - 1.0;
        let ratio = nb_baby / nb_giant;
        if ratio == max_ratio {
            return n1;
        }
        if ratio > max_ratio {
            return (n1 / 2).max(1);
        }
        n1 <<= 1;
    }
    1
}

/// Rotation schedule for one compiled block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BsgsPlan {
    slots: usize,
    n1: usize,
    index: BTreeMap<usize, Vec<usize>>,
}

impl BsgsPlan {
    pub fn new(diag_idxs: &[i64], slots: usize, bsgs_ratio: f64) -> Result<Self> {
        if !slots.is_power_of_two() {
            return Err(Error::InvalidParams(format!(
                "slot count must be a power of two, got {}",
                slots
            )));
        }
        let mut diags: Vec<usize> = diag_idxs
            .iter()
            .map(|&i| normalize_index(i, slots))
            .collect();
        diags.sort_unstable();
        diags.dedup();

        let n1 = find_baby_step(&diags, slots, log_ratio_bound(bsgs_ratio));
        let (index, _, _) = bsgs_index(&diags, n1);
        Ok(Self { slots, n1, index })
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Baby-step size n1
    pub fn baby_step(&self) -> usize {
        self.n1
    }

    /// Non-zero giant-step rotations applied to partial sums
    pub fn giant_rotations(&self) -> Vec<usize> {
        self.index.keys().copied().filter(|&g| g != 0).collect()
    }

    /// Non-zero baby-step rotations applied to the input
    pub fn baby_rotations(&self) -> Vec<usize> {
        let babies: BTreeSet<usize> = self.index.values().flatten().copied().collect();
        babies.into_iter().filter(|&b| b != 0).collect()
    }

    /// Every rotation amount an evaluation needs a key for
    pub fn rotations(&self) -> BTreeSet<usize> {
        self.giant_rotations()
            .into_iter()
            .chain(self.baby_rotations())
            .collect()
    }

    /// Pre-rotate diagonals into the giant-step buckets.
    ///
    /// Diagonals whose indices coincide modulo the slot count are summed.
    pub fn encode<'a, I>(&self, diagonals: I) -> Result<EncodedTransform>
    where
        I: IntoIterator<Item = (i64, &'a [f64])>,
    {
        let mut by_index: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        for (idx, data) in diagonals {
            if data.len() != self.slots {
                return Err(Error::InvalidLayer(format!(
                    "diagonal {} has {} values, expected {}",
                    idx,
                    data.len(),
                    self.slots
                )));
            }
            let acc = by_index
                .entry(normalize_index(idx, self.slots))
                .or_insert_with(|| vec![0.0; self.slots]);
            for (a, v) in acc.iter_mut().zip(data) {
                *a += v;
            }
        }

        let mut giant_steps = Vec::with_capacity(self.index.len());
        for (&g, babies) in &self.index {
            let mut terms = Vec::with_capacity(babies.len());
            for &b in babies {
                let diag = by_index.get(&(g + b)).ok_or_else(|| {
                    Error::InvalidLayer(format!("diagonal {} missing from encoding input", g + b))
                })?;
                // rot_{-g}(diag) == rot_{n-g}(diag)
                let shift = (self.slots - g) % self.slots;
                terms.push((b, rotate(diag, shift)));
            }
            giant_steps.push((g, terms));
        }

        Ok(EncodedTransform {
            slots: self.slots,
            giant_steps,
        })
    }
}

/// Diagonals laid out for baby-step/giant-step evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTransform {
    slots: usize,
    giant_steps: Vec<(usize, Vec<(usize, Vec<f64>)>)>,
}

impl EncodedTransform {
    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn diagonal_count(&self) -> usize {
        self.giant_steps.iter().map(|(_, t)| t.len()).sum()
    }

    pub fn apply(&self, input: &[f64]) -> Vec<f64> {
        let n = self.slots;
        let mut baby_cache: BTreeMap<usize, Vec<f64>> = BTreeMap::new();
        let mut out = vec![0.0; n];

        for (g, terms) in &self.giant_steps {
            let mut partial = vec![0.0; n];
            for (b, diag) in terms {
                let rotated = baby_cache.entry(*b).or_insert_with(|| rotate(input, *b));
                for k in 0..n {
                    partial[k] += diag[k] * rotated[k];
                }
            }
            let partial = rotate(&partial, *g);
            for k in 0..n {
                out[k] += partial[k];
            }
        }
        out
    }
}
