//! Batched substitution of symbols by expressions.
//!
//! One memo is shared by every vector handed to a call, so a replacement
//! that occurs under many equations is rebuilt once and the results keep
//! sharing their subexpressions. Nodes whose children are unchanged are
//! returned as-is.

use std::collections::HashMap;

use tracing::trace;

use crate::error::{OcpError, Result};
use crate::sx::{depends_on, Sx, SxKind};

pub struct Substitution<'a> {
    index: HashMap<usize, usize>,
    targets: Vec<Sx>,
    replacements: &'a [Sx],
    /// Replacements are themselves substituted before use.
    chained: bool,
    in_progress: Vec<bool>,
    memo: HashMap<usize, Sx>,
}

enum Frame {
    Visit(Sx),
    Build(Sx),
    /// Binds target `k` once its definition has been rewritten.
    Resolve(usize, Sx),
}

impl<'a> Substitution<'a> {
    /// Simultaneous substitution: replacements are inserted verbatim.
    pub fn new(targets: &[Sx], replacements: &'a [Sx]) -> Result<Self> {
        Self::build(targets, replacements, false)
    }

    /// Chained substitution: a replacement that mentions other targets has
    /// them resolved first. Cyclic definitions are left unresolved.
    pub fn chained(targets: &[Sx], replacements: &'a [Sx]) -> Result<Self> {
        Self::build(targets, replacements, true)
    }

    fn build(targets: &[Sx], replacements: &'a [Sx], chained: bool) -> Result<Self> {
        if targets.len() != replacements.len() {
            return Err(OcpError::DimensionMismatch(format!(
                "{} substitution targets but {} replacements",
                targets.len(),
                replacements.len()
            )));
        }
        let mut index = HashMap::with_capacity(targets.len());
        for (k, target) in targets.iter().enumerate() {
            if !target.is_symbolic() {
                return Err(OcpError::NonSymbolic(format!("substitution target {target}")));
            }
            if index.insert(target.id(), k).is_some() {
                return Err(OcpError::DimensionMismatch(format!(
                    "substitution target {target} appears more than once"
                )));
            }
        }
        Ok(Self {
            index,
            targets: targets.to_vec(),
            replacements,
            chained,
            in_progress: vec![false; targets.len()],
            memo: HashMap::new(),
        })
    }

    pub fn apply(&mut self, expr: &Sx) -> Sx {
        let mut stack = vec![Frame::Visit(expr.clone())];
        while let Some(frame) = stack.pop() {
            match frame {
                Frame::Visit(e) => {
                    if self.memo.contains_key(&e.id()) {
                        continue;
                    }
                    match e.kind() {
                        SxKind::Constant(_) => {
                            self.memo.insert(e.id(), e.clone());
                        }
                        SxKind::Symbol(_) => match self.index.get(&e.id()).copied() {
                            None => {
                                self.memo.insert(e.id(), e.clone());
                            }
                            Some(k) if !self.chained => {
                                self.memo.insert(e.id(), self.replacements[k].clone());
                            }
                            Some(k) if self.in_progress[k] => {
                                // cycle: leave the target in place
                                self.memo.insert(e.id(), e.clone());
                            }
                            Some(k) => {
                                self.in_progress[k] = true;
                                let definition = self.replacements[k].clone();
                                stack.push(Frame::Resolve(k, e.clone()));
                                stack.push(Frame::Visit(definition));
                            }
                        },
                        SxKind::Unary(_, a) => {
                            let a = a.clone();
                            stack.push(Frame::Build(e.clone()));
                            stack.push(Frame::Visit(a));
                        }
                        SxKind::Binary(_, a, b) => {
                            let (a, b) = (a.clone(), b.clone());
                            stack.push(Frame::Build(e.clone()));
                            stack.push(Frame::Visit(b));
                            stack.push(Frame::Visit(a));
                        }
                    }
                }
                Frame::Build(e) => {
                    let out = match e.kind() {
                        SxKind::Unary(op, a) => {
                            let na = self.mapped(a);
                            if na.is_equal(a) {
                                e.clone()
                            } else {
                                Sx::unary(*op, &na)
                            }
                        }
                        SxKind::Binary(op, a, b) => {
                            let na = self.mapped(a);
                            let nb = self.mapped(b);
                            if na.is_equal(a) && nb.is_equal(b) {
                                e.clone()
                            } else {
                                Sx::binary(*op, &na, &nb)
                            }
                        }
                        _ => e.clone(),
                    };
                    self.memo.insert(e.id(), out);
                }
                Frame::Resolve(k, target) => {
                    let resolved = self.mapped(&self.replacements[k]);
                    self.in_progress[k] = false;
                    self.memo.insert(target.id(), resolved);
                }
            }
        }
        self.mapped(expr)
    }

    fn mapped(&self, expr: &Sx) -> Sx {
        self.memo
            .get(&expr.id())
            .cloned()
            .unwrap_or_else(|| expr.clone())
    }

    pub fn apply_all(&mut self, exprs: &[Sx]) -> Vec<Sx> {
        exprs.iter().map(|expr| self.apply(expr)).collect()
    }

    /// The fully substituted replacement of target `k`.
    pub fn replacement(&mut self, k: usize) -> Sx {
        if !self.chained {
            return self.replacements[k].clone();
        }
        let target = self.targets[k].clone();
        self.apply(&target)
    }
}

/// Replaces every occurrence of `targets[k]` by `replacements[k]` in all
/// vectors at once.
pub fn substitute_all(
    targets: &[Sx],
    replacements: &[Sx],
    vectors: &[Vec<Sx>],
) -> Result<Vec<Vec<Sx>>> {
    let mut substitution = Substitution::new(targets, replacements)?;
    Ok(vectors
        .iter()
        .map(|exprs| substitution.apply_all(exprs))
        .collect())
}

/// Eliminates `targets` from `definitions` and from every vector, in place.
///
/// Each definition is first rewritten in terms of non-target symbols, then
/// bound to its target. Returns true if anything still depends on a target
/// afterwards, which happens only for cyclic definitions.
pub fn substitute_in_place(
    targets: &[Sx],
    definitions: &mut [Sx],
    vectors: &mut [&mut Vec<Sx>],
) -> Result<bool> {
    let snapshot = definitions.to_vec();
    let mut substitution = Substitution::chained(targets, &snapshot)?;
    for (k, definition) in definitions.iter_mut().enumerate() {
        *definition = substitution.replacement(k);
    }
    for exprs in vectors.iter_mut() {
        let rewritten = substitution.apply_all(exprs);
        **exprs = rewritten;
    }

    let residual = depends_on(definitions, targets)
        || vectors.iter().any(|exprs| depends_on(exprs, targets));
    trace!(
        targets = targets.len(),
        vectors = vectors.len(),
        residual,
        "substituted in place"
    );
    Ok(residual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_all_is_simultaneous() {
        let x = Sx::sym("x");
        let y = Sx::sym("y");
        // swap: x -> y, y -> x
        let out = substitute_all(
            &[x.clone(), y.clone()],
            &[y.clone(), x.clone()],
            &[vec![&x - &y * 2.0], vec![x.clone()]],
        )
        .expect("substitution should succeed");
        assert_eq!(out[0][0].to_string(), "(y-(x*2))");
        assert!(out[1][0].is_equal(&y));
    }

    #[test]
    fn shared_nodes_are_rebuilt_once() {
        let x = Sx::sym("x");
        let p = Sx::sym("p");
        let shared = (&x + 1.0).sin();
        let out = substitute_all(
            &[x.clone()],
            &[&p * 3.0],
            &[vec![shared.clone() * 2.0], vec![shared.exp()]],
        )
        .expect("substitution should succeed");
        let SxKind::Binary(_, a, _) = out[0][0].kind() else {
            panic!("expected a product");
        };
        let SxKind::Unary(_, b) = out[1][0].kind() else {
            panic!("expected exp");
        };
        assert!(a.is_equal(b));
    }

    #[test]
    fn untouched_expressions_keep_their_identity() {
        let x = Sx::sym("x");
        let a = Sx::sym("a");
        let expr = &a * 2.0;
        let out = substitute_all(&[x], &[Sx::one()], &[vec![expr.clone()]]).unwrap();
        assert!(out[0][0].is_equal(&expr));
    }

    #[test]
    fn in_place_resolves_chained_definitions() {
        let i0 = Sx::sym("i0");
        let i1 = Sx::sym("i1");
        let a = Sx::sym("a");
        let mut defs = vec![&a * 2.0, &i0 + 1.0];
        let mut eqs = vec![&i1 * &i0];
        let residual = substitute_in_place(&[i0.clone(), i1.clone()], &mut defs, &mut [&mut eqs])
            .expect("substitution should succeed");
        assert!(!residual);
        assert_eq!(defs[1].to_string(), "((a*2)+1)");
        assert!(!depends_on(&eqs, &[i0, i1]));
    }

    #[test]
    fn in_place_reports_cycles() {
        let i0 = Sx::sym("i0");
        let i1 = Sx::sym("i1");
        let mut defs = vec![&i1 + 1.0, &i0 * 2.0];
        let mut eqs = vec![i0.clone()];
        let residual = substitute_in_place(&[i0, i1], &mut defs, &mut [&mut eqs])
            .expect("substitution should succeed");
        assert!(residual);
    }

    #[test]
    fn in_place_handles_long_definition_chains() {
        let n = 20_000;
        let a = Sx::sym("a");
        let targets: Vec<Sx> = (0..n).map(|k| Sx::sym(format!("i{k}"))).collect();
        // i_k = i_{k+1} + a, so resolving i_0 walks the whole chain
        let mut defs: Vec<Sx> = (0..n - 1).map(|k| &targets[k + 1] + &a).collect();
        defs.push(a.clone());
        let mut eqs = vec![targets[0].clone()];
        let residual = substitute_in_place(&targets, &mut defs, &mut [&mut eqs])
            .expect("substitution should succeed");
        assert!(!residual);
        assert_eq!(crate::sx::symvar(&eqs).len(), 1);
    }

    #[test]
    fn rejects_bad_targets() {
        let x = Sx::sym("x");
        assert!(matches!(
            substitute_all(&[x.clone()], &[], &[]),
            Err(OcpError::DimensionMismatch(_))
        ));
        assert!(matches!(
            substitute_all(&[&x * 2.0], &[Sx::one()], &[]),
            Err(OcpError::NonSymbolic(_))
        ));
    }
}
