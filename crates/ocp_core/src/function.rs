//! Symbolic functions of one input vector.
//!
//! [`SxFunction`] pairs a vector of leaf symbols (the inputs) with a vector of
//! expressions (the outputs) and answers structural questions about the pair:
//! the Jacobian sparsity, boolean forward/backward dependency propagation and
//! the exact symbolic Jacobian. None of these evaluate anything numerically.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use nalgebra::DMatrix;
use nalgebra_sparse::pattern::SparsityPattern;

use crate::equation_engine::{CompiledFunction, Compiler};
use crate::error::{OcpError, Result};
use crate::sx::{Sx, SxKind};
use crate::traits::Scalar;

#[derive(Debug, Clone)]
pub struct SxFunction {
    inputs: Vec<Sx>,
    outputs: Vec<Sx>,
    input_index: HashMap<usize, usize>,
}

impl SxFunction {
    /// Inputs must be distinct leaf symbols.
    pub fn new(inputs: &[Sx], outputs: &[Sx]) -> Result<Self> {
        let mut input_index = HashMap::with_capacity(inputs.len());
        for (k, input) in inputs.iter().enumerate() {
            if !input.is_symbolic() {
                return Err(OcpError::NonSymbolic(format!("function input {input}")));
            }
            if input_index.insert(input.id(), k).is_some() {
                return Err(OcpError::DimensionMismatch(format!(
                    "function input {input} appears more than once"
                )));
            }
        }
        Ok(Self {
            inputs: inputs.to_vec(),
            outputs: outputs.to_vec(),
            input_index,
        })
    }

    pub fn n_in(&self) -> usize {
        self.inputs.len()
    }

    pub fn n_out(&self) -> usize {
        self.outputs.len()
    }

    /// Boolean pattern of d(outputs)/d(inputs): one row per output, one
    /// column per input.
    pub fn jac_sparsity(&self) -> Result<SparsityPattern> {
        let mut memo = HashMap::new();
        let mut offsets = Vec::with_capacity(self.n_out() + 1);
        let mut indices = Vec::new();
        offsets.push(0);
        for output in &self.outputs {
            let deps = self.input_dependencies(output, &mut memo);
            indices.extend(deps.iter().copied());
            offsets.push(indices.len());
        }
        SparsityPattern::try_from_offsets_and_indices(self.n_out(), self.n_in(), offsets, indices)
            .map_err(|err| OcpError::DimensionMismatch(format!("invalid sparsity: {err}")))
    }

    /// Sorted input indices that `expr` structurally depends on.
    fn input_dependencies(
        &self,
        expr: &Sx,
        memo: &mut HashMap<usize, Rc<Vec<usize>>>,
    ) -> Rc<Vec<usize>> {
        post_order(expr, memo, |memo, id| memo.contains_key(&id), |memo, node| {
            let deps = match node.kind() {
                SxKind::Constant(_) => Rc::new(Vec::new()),
                SxKind::Symbol(_) => match self.input_index.get(&node.id()) {
                    Some(&k) => Rc::new(vec![k]),
                    None => Rc::new(Vec::new()),
                },
                SxKind::Unary(_, a) => memo[&a.id()].clone(),
                SxKind::Binary(_, a, b) => {
                    let da = &memo[&a.id()];
                    let db = &memo[&b.id()];
                    if db.is_empty() {
                        da.clone()
                    } else if da.is_empty() {
                        db.clone()
                    } else {
                        Rc::new(merge_sorted(da, db))
                    }
                }
            };
            memo.insert(node.id(), deps);
        });
        memo[&expr.id()].clone()
    }

    /// Forward propagation: which outputs depend on any seeded input.
    pub fn sp_forward(&self, seed: &[bool]) -> Result<Vec<bool>> {
        if seed.len() != self.n_in() {
            return Err(OcpError::DimensionMismatch(format!(
                "forward seed has {} entries, function has {} inputs",
                seed.len(),
                self.n_in()
            )));
        }
        let mut memo: HashMap<usize, bool> = HashMap::new();
        let mut hits = Vec::with_capacity(self.n_out());
        for output in &self.outputs {
            post_order(output, &mut memo, |memo, id| memo.contains_key(&id), |memo, node| {
                let hit = match node.kind() {
                    SxKind::Constant(_) => false,
                    SxKind::Symbol(_) => self
                        .input_index
                        .get(&node.id())
                        .is_some_and(|&k| seed[k]),
                    SxKind::Unary(_, a) => memo[&a.id()],
                    SxKind::Binary(_, a, b) => memo[&a.id()] || memo[&b.id()],
                };
                memo.insert(node.id(), hit);
            });
            hits.push(memo[&output.id()]);
        }
        Ok(hits)
    }

    /// Backward propagation: which inputs enter any seeded output.
    pub fn sp_backward(&self, seed: &[bool]) -> Result<Vec<bool>> {
        if seed.len() != self.n_out() {
            return Err(OcpError::DimensionMismatch(format!(
                "backward seed has {} entries, function has {} outputs",
                seed.len(),
                self.n_out()
            )));
        }
        let mut reached = vec![false; self.n_in()];
        let mut visited = HashSet::new();
        let mut stack: Vec<&Sx> = self
            .outputs
            .iter()
            .zip(seed)
            .filter(|(_, seeded)| **seeded)
            .map(|(output, _)| output)
            .collect();
        while let Some(expr) = stack.pop() {
            if !visited.insert(expr.id()) {
                continue;
            }
            match expr.kind() {
                SxKind::Constant(_) => {}
                SxKind::Symbol(_) => {
                    if let Some(&k) = self.input_index.get(&expr.id()) {
                        reached[k] = true;
                    }
                }
                SxKind::Unary(_, a) => stack.push(a),
                SxKind::Binary(_, a, b) => {
                    stack.push(a);
                    stack.push(b);
                }
            }
        }
        Ok(reached)
    }

    /// Exact symbolic Jacobian. Entries outside the sparsity pattern are the
    /// constant zero.
    pub fn jacobian(&self) -> Result<DMatrix<Sx>> {
        let pattern = self.jac_sparsity()?;
        let mut memos: Vec<HashMap<usize, Sx>> = vec![HashMap::new(); self.n_in()];
        let mut jac = DMatrix::from_element(self.n_out(), self.n_in(), Sx::zero());
        for (row, output) in self.outputs.iter().enumerate() {
            for &col in pattern.lane(row) {
                jac[(row, col)] = output.differentiate(&self.inputs[col], &mut memos[col]);
            }
        }
        Ok(jac)
    }

    /// Compiles every output to bytecode for numerical evaluation.
    pub fn compile<T: Scalar>(&self) -> Result<CompiledFunction<T>> {
        let compiler = Compiler::new(&self.inputs);
        let programs = self
            .outputs
            .iter()
            .map(|output| compiler.compile(output))
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledFunction::new(programs, self.n_in()))
    }
}

/// Visits every node under `root` children first, calling `visit` once per
/// node for which `done` is false.
pub(crate) fn post_order<S>(
    root: &Sx,
    state: &mut S,
    done: impl Fn(&S, usize) -> bool,
    mut visit: impl FnMut(&mut S, &Sx),
) {
    let mut stack = vec![(root.clone(), false)];
    while let Some((expr, expanded)) = stack.pop() {
        if done(state, expr.id()) {
            continue;
        }
        if !expanded {
            match expr.kind() {
                SxKind::Unary(_, a) => {
                    stack.push((expr.clone(), true));
                    stack.push((a.clone(), false));
                    continue;
                }
                SxKind::Binary(_, a, b) => {
                    stack.push((expr.clone(), true));
                    stack.push((b.clone(), false));
                    stack.push((a.clone(), false));
                    continue;
                }
                _ => {}
            }
        }
        visit(state, &expr);
    }
}

fn merge_sorted(a: &[usize], b: &[usize]) -> Vec<usize> {
    let mut merged = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] < b[j] {
            merged.push(a[i]);
            i += 1;
        } else if b[j] < a[i] {
            merged.push(b[j]);
            j += 1;
        } else {
            merged.push(a[i]);
            i += 1;
            j += 1;
        }
    }
    merged.extend_from_slice(&a[i..]);
    merged.extend_from_slice(&b[j..]);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jac_sparsity_reports_structural_pattern() {
        let x = Sx::sym("x");
        let y = Sx::sym("y");
        let a = Sx::sym("a");
        let f = SxFunction::new(&[x.clone(), y.clone()], &[&a * &x, &x * &y + 1.0, a.clone()])
            .expect("function should build");
        let sp = f.jac_sparsity().expect("sparsity should compute");
        assert_eq!(sp.major_dim(), 3);
        assert_eq!(sp.minor_dim(), 2);
        assert_eq!(sp.lane(0), &[0]);
        assert_eq!(sp.lane(1), &[0, 1]);
        assert!(sp.lane(2).is_empty());
    }

    #[test]
    fn forward_and_backward_propagation() {
        let s0 = Sx::sym("s0");
        let s1 = Sx::sym("s1");
        let f = SxFunction::new(&[s0.clone(), s1.clone()], &[s0.exp(), Sx::sym("p") * 2.0])
            .expect("function should build");
        assert_eq!(f.sp_forward(&[true, true]).unwrap(), vec![true, false]);
        assert_eq!(f.sp_backward(&[true, true]).unwrap(), vec![true, false]);
        assert_eq!(f.sp_backward(&[false, true]).unwrap(), vec![false, false]);
        assert!(f.sp_forward(&[true]).is_err());
    }

    #[test]
    fn rejects_non_symbolic_or_repeated_inputs() {
        let x = Sx::sym("x");
        assert!(matches!(
            SxFunction::new(&[&x + 1.0], &[]),
            Err(OcpError::NonSymbolic(_))
        ));
        assert!(matches!(
            SxFunction::new(&[x.clone(), x.clone()], &[]),
            Err(OcpError::DimensionMismatch(_))
        ));
    }

    #[test]
    fn jacobian_matches_hand_derivatives() {
        let x = Sx::sym("x");
        let y = Sx::sym("y");
        let f = SxFunction::new(&[x.clone(), y.clone()], &[&x * &y, x.sin()])
            .expect("function should build");
        let jac = f.jacobian().expect("jacobian should compute");
        let entries: Vec<Sx> = jac.iter().cloned().collect();
        let g = SxFunction::new(&[x, y], &entries).unwrap();
        let values = g.compile::<f64>().unwrap().eval(&[0.5, 3.0]).unwrap();
        // column-major: d0/dx, d1/dx, d0/dy, d1/dy
        let expected = [3.0, 0.5_f64.cos(), 0.5, 0.0];
        for (v, e) in values.iter().zip(expected) {
            assert!((v - e).abs() < 1e-12);
        }
        assert!(jac[(1, 1)].is_zero());
    }
}
