//! Block-triangular (BLT) ordering via the Dulmage-Mendelsohn decomposition.
//!
//! Rows of the sparsity pattern are equations, columns are unknowns. The
//! decomposition is laid out *lower* block triangular:
//!
//! ```text
//!   over-determined part | fine square blocks (dependency order) | under-determined part
//! ```
//!
//! so the equations of block `b` only touch unknowns of blocks `0..=b`, and a
//! structurally nonsingular system can be solved block by block from the top.
//! The coarse bounds delimit the three parts: `[0, over_end, square_end, n]`.

use std::ops::Range;

use nalgebra_sparse::pattern::SparsityPattern;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::error::{OcpError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BltDecomposition {
    /// `row_perm[k]` is the original equation placed at position `k`.
    pub row_perm: Vec<usize>,
    /// `col_perm[k]` is the original unknown placed at position `k`.
    pub col_perm: Vec<usize>,
    /// Row boundaries of the fine blocks, `num_blocks() + 1` entries.
    pub row_blocks: Vec<usize>,
    pub col_blocks: Vec<usize>,
    pub coarse_row_blocks: [usize; 4],
    pub coarse_col_blocks: [usize; 4],
}

impl BltDecomposition {
    pub fn num_blocks(&self) -> usize {
        self.row_blocks.len() - 1
    }

    pub fn block_rows(&self, block: usize) -> Range<usize> {
        self.row_blocks[block]..self.row_blocks[block + 1]
    }

    pub fn block_cols(&self, block: usize) -> Range<usize> {
        self.col_blocks[block]..self.col_blocks[block + 1]
    }

    /// True when the block has as many equations as unknowns.
    pub fn is_square_block(&self, block: usize) -> bool {
        self.block_rows(block).len() == self.block_cols(block).len()
    }

    /// True if the pattern admits a perfect matching.
    pub fn is_structurally_nonsingular(&self) -> bool {
        self.coarse_row_blocks[1] == 0 && self.coarse_row_blocks[2] == self.coarse_row_blocks[3]
    }
}

/// BLT ordering of a square pattern. Fails with `NonSquareJacobian` otherwise.
pub fn block_triangularize(pattern: &SparsityPattern) -> Result<BltDecomposition> {
    let (rows, cols) = (pattern.major_dim(), pattern.minor_dim());
    if rows != cols {
        return Err(OcpError::NonSquareJacobian { rows, cols });
    }
    Ok(dulmage_mendelsohn(pattern))
}

/// Dulmage-Mendelsohn decomposition of an arbitrary pattern.
pub fn dulmage_mendelsohn(pattern: &SparsityPattern) -> BltDecomposition {
    let n_row = pattern.major_dim();
    let n_col = pattern.minor_dim();
    let (row_match, col_match) = maximum_matching(pattern);

    // Under-determined part: alternating paths from unmatched columns.
    let by_col = pattern.transpose();
    let mut under_row = vec![false; n_row];
    let mut under_col = vec![false; n_col];
    let mut under_rows = Vec::new();
    let mut under_cols: Vec<usize> = (0..n_col).filter(|&c| col_match[c].is_none()).collect();
    for &c in &under_cols {
        under_col[c] = true;
    }
    let mut head = 0;
    while head < under_cols.len() {
        let c = under_cols[head];
        head += 1;
        for &r in by_col.lane(c) {
            if under_row[r] {
                continue;
            }
            under_row[r] = true;
            under_rows.push(r);
            if let Some(c2) = row_match[r] {
                if !under_col[c2] {
                    under_col[c2] = true;
                    under_cols.push(c2);
                }
            }
        }
    }

    // Over-determined part: alternating paths from unmatched rows.
    let mut over_row = vec![false; n_row];
    let mut over_col = vec![false; n_col];
    let mut over_rows: Vec<usize> = (0..n_row).filter(|&r| row_match[r].is_none()).collect();
    let mut over_cols = Vec::new();
    for &r in &over_rows {
        over_row[r] = true;
    }
    let mut head = 0;
    while head < over_rows.len() {
        let r = over_rows[head];
        head += 1;
        for &c in pattern.lane(r) {
            if over_col[c] {
                continue;
            }
            over_col[c] = true;
            over_cols.push(c);
            if let Some(r2) = col_match[c] {
                if !over_row[r2] {
                    over_row[r2] = true;
                    over_rows.push(r2);
                }
            }
        }
    }

    let square_col: Vec<bool> = (0..n_col).map(|c| !under_col[c] && !over_col[c]).collect();

    // A square row points at the rows matched to the unknowns it uses.
    // Components come out in reverse topological order, so every block is
    // placed after the blocks it depends on.
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut node_of: Vec<Option<NodeIndex>> = vec![None; n_row];
    for r in 0..n_row {
        if !under_row[r] && !over_row[r] {
            node_of[r] = Some(graph.add_node(r));
        }
    }
    for r in 0..n_row {
        let Some(from) = node_of[r] else { continue };
        for &c in pattern.lane(r) {
            if !square_col[c] {
                continue;
            }
            if let Some(to) = col_match[c].and_then(|w| node_of[w]) {
                if to != from {
                    graph.add_edge(from, to, ());
                }
            }
        }
    }
    let square_blocks: Vec<Vec<usize>> = tarjan_scc(&graph)
        .into_iter()
        .map(|component| component.into_iter().map(|n| graph[n]).collect())
        .collect();

    let mut row_perm = Vec::with_capacity(n_row);
    let mut col_perm = Vec::with_capacity(n_col);
    let mut row_blocks = vec![0];
    let mut col_blocks = vec![0];

    row_perm.extend_from_slice(&over_rows);
    col_perm.extend_from_slice(&over_cols);
    if !over_rows.is_empty() || !over_cols.is_empty() {
        row_blocks.push(row_perm.len());
        col_blocks.push(col_perm.len());
    }
    let over_end = (row_perm.len(), col_perm.len());

    for block in &square_blocks {
        for &r in block {
            row_perm.push(r);
            // Square rows are always matched into the square part.
            if let Some(c) = row_match[r] {
                col_perm.push(c);
            }
        }
        row_blocks.push(row_perm.len());
        col_blocks.push(col_perm.len());
    }
    let square_end = (row_perm.len(), col_perm.len());

    row_perm.extend_from_slice(&under_rows);
    col_perm.extend_from_slice(&under_cols);
    if !under_rows.is_empty() || !under_cols.is_empty() {
        row_blocks.push(row_perm.len());
        col_blocks.push(col_perm.len());
    }

    BltDecomposition {
        row_perm,
        col_perm,
        row_blocks,
        col_blocks,
        coarse_row_blocks: [0, over_end.0, square_end.0, n_row],
        coarse_col_blocks: [0, over_end.1, square_end.1, n_col],
    }
}

/// Maximum bipartite matching (Kuhn's augmenting paths after a greedy pass).
fn maximum_matching(pattern: &SparsityPattern) -> (Vec<Option<usize>>, Vec<Option<usize>>) {
    let n_row = pattern.major_dim();
    let n_col = pattern.minor_dim();
    let mut row_match = vec![None; n_row];
    let mut col_match = vec![None; n_col];

    for r in 0..n_row {
        for &c in pattern.lane(r) {
            if col_match[c].is_none() {
                row_match[r] = Some(c);
                col_match[c] = Some(r);
                break;
            }
        }
    }

    let mut stamp = vec![usize::MAX; n_col];
    for r in 0..n_row {
        if row_match[r].is_none() {
            augment(pattern, r, r, &mut stamp, &mut row_match, &mut col_match);
        }
    }
    (row_match, col_match)
}

/// Searches an augmenting path from the unmatched row `root` and flips it.
fn augment(
    pattern: &SparsityPattern,
    root: usize,
    round: usize,
    stamp: &mut [usize],
    row_match: &mut [Option<usize>],
    col_match: &mut [Option<usize>],
) -> bool {
    // (row, next position in its lane); `cols[k]` leads from path[k] to path[k + 1]
    let mut path = vec![(root, 0)];
    let mut cols: Vec<usize> = Vec::new();
    while let Some(top) = path.last_mut() {
        let (r, pos) = *top;
        let lane = pattern.lane(r);
        if pos == lane.len() {
            path.pop();
            cols.pop();
            continue;
        }
        top.1 += 1;
        let c = lane[pos];
        if stamp[c] == round {
            continue;
        }
        stamp[c] = round;
        cols.push(c);
        match col_match[c] {
            None => {
                for (&(row, _), &col) in path.iter().zip(&cols) {
                    row_match[row] = Some(col);
                    col_match[col] = Some(row);
                }
                return true;
            }
            Some(r2) => path.push((r2, 0)),
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(n_row: usize, n_col: usize, rows: &[&[usize]]) -> SparsityPattern {
        let mut offsets = vec![0];
        let mut indices = Vec::new();
        for row in rows {
            indices.extend_from_slice(row);
            offsets.push(indices.len());
        }
        SparsityPattern::try_from_offsets_and_indices(n_row, n_col, offsets, indices)
            .expect("valid pattern")
    }

    /// Every entry of a permuted row lies in a column block no later than the row's block.
    fn assert_lower_block_triangular(sp: &SparsityPattern, blt: &BltDecomposition) {
        let mut row_block = vec![0; sp.major_dim()];
        let mut col_block = vec![0; sp.minor_dim()];
        for b in 0..blt.num_blocks() {
            for k in blt.block_rows(b) {
                row_block[blt.row_perm[k]] = b;
            }
            for k in blt.block_cols(b) {
                col_block[blt.col_perm[k]] = b;
            }
        }
        for r in 0..sp.major_dim() {
            for &c in sp.lane(r) {
                assert!(
                    col_block[c] <= row_block[r],
                    "row {r} (block {}) uses column {c} (block {})",
                    row_block[r],
                    col_block[c]
                );
            }
        }
    }

    fn assert_permutation(perm: &[usize], n: usize) {
        let mut seen = vec![false; n];
        for &k in perm {
            assert!(!seen[k]);
            seen[k] = true;
        }
        assert_eq!(perm.len(), n);
    }

    #[test]
    fn rejects_non_square_patterns() {
        let sp = pattern(2, 3, &[&[0], &[1, 2]]);
        assert_eq!(
            block_triangularize(&sp),
            Err(OcpError::NonSquareJacobian { rows: 2, cols: 3 })
        );
    }

    #[test]
    fn triangular_chain_splits_into_singletons() {
        // e0: v2, e1: v0 v2, e2: v0 v1 v2
        let sp = pattern(3, 3, &[&[2], &[0, 2], &[0, 1, 2]]);
        let blt = block_triangularize(&sp).expect("square");
        assert_eq!(blt.num_blocks(), 3);
        assert_eq!(blt.row_perm, vec![0, 1, 2]);
        assert_eq!(blt.col_perm, vec![2, 0, 1]);
        assert!(blt.is_structurally_nonsingular());
        assert_lower_block_triangular(&sp, &blt);
    }

    #[test]
    fn cycle_forms_one_block() {
        // e0: v0 v1, e1: v0 v1, e2: v2 v0
        let sp = pattern(3, 3, &[&[0, 1], &[0, 1], &[0, 2]]);
        let blt = block_triangularize(&sp).expect("square");
        assert_eq!(blt.num_blocks(), 2);
        assert_eq!(blt.block_rows(0).len(), 2);
        assert_eq!(blt.row_perm[2], 2);
        assert_eq!(blt.col_perm[2], 2);
        assert_lower_block_triangular(&sp, &blt);
    }

    #[test]
    fn structurally_singular_pattern_gets_coarse_parts() {
        // e0 and e1 both only use v0; v1 and v2 appear in e2 alone.
        let sp = pattern(3, 3, &[&[0], &[0], &[1, 2]]);
        let blt = block_triangularize(&sp).expect("square");
        assert!(!blt.is_structurally_nonsingular());
        assert_eq!(blt.coarse_row_blocks, [0, 2, 2, 3]);
        assert_eq!(blt.coarse_col_blocks, [0, 1, 1, 3]);
        assert!(!blt.is_square_block(0));
        assert_permutation(&blt.row_perm, 3);
        assert_permutation(&blt.col_perm, 3);
        assert_lower_block_triangular(&sp, &blt);
    }

    #[test]
    fn long_augmenting_paths_are_followed() {
        // Greedy pass matches e_k to v_k, leaving the last equation to shift the
        // whole diagonal by one: e_k uses v_k and v_{k+1}, e_{n-1} only v_0.
        let n = 20_000;
        let rows: Vec<Vec<usize>> = (0..n)
            .map(|k| if k + 1 < n { vec![k, k + 1] } else { vec![0] })
            .collect();
        let row_refs: Vec<&[usize]> = rows.iter().map(|r| r.as_slice()).collect();
        let sp = pattern(n, n, &row_refs);
        let blt = block_triangularize(&sp).expect("square");
        assert!(blt.is_structurally_nonsingular());
        assert_permutation(&blt.row_perm, n);
        assert_permutation(&blt.col_perm, n);
        assert_lower_block_triangular(&sp, &blt);
    }

    #[test]
    fn empty_pattern_has_no_blocks() {
        let sp = pattern(0, 0, &[]);
        let blt = block_triangularize(&sp).expect("square");
        assert_eq!(blt.num_blocks(), 0);
    }

    #[test]
    fn lower_block_triangular_on_pseudo_random_patterns() {
        let mut state = 0x2545_f491_4f6c_dd1d_u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for n in 1..12 {
            for _ in 0..20 {
                let rows: Vec<Vec<usize>> = (0..n)
                    .map(|_| (0..n).filter(|_| next() % 4 == 0).collect())
                    .collect();
                let row_refs: Vec<&[usize]> = rows.iter().map(|r| r.as_slice()).collect();
                let sp = pattern(n, n, &row_refs);
                let blt = block_triangularize(&sp).expect("square");
                assert_permutation(&blt.row_perm, n);
                assert_permutation(&blt.col_perm, n);
                assert_lower_block_triangular(&sp, &blt);
            }
        }
    }
}
