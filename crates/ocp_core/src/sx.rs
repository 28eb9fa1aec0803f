//! Scalar symbolic expressions.
//!
//! An [`Sx`] is an immutable, reference-counted node in an expression DAG.
//! Cloning is cheap and shares the node, which is what lets substitution and
//! differentiation reuse common subexpressions. Every node carries a
//! process-unique id; symbols are compared by that id, so two calls to
//! `Sx::sym("x")` produce two different symbols.
//!
//! Construction performs local constant folding and the identity rules
//! `0+a`, `a-0`, `0*a`, `1*a`, `a/1`, `--a` and `a-a`. Nothing more: there is
//! no general simplifier. These rules are enough for a Jacobian entry of an
//! affine unknown to come out free of that unknown.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Tanh,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Neg => "neg",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sin => "sin",
            UnaryOp::Cos => "cos",
            UnaryOp::Tan => "tan",
            UnaryOp::Tanh => "tanh",
        }
    }

    /// Looks up a function by the name used in expression text.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sqrt" => Some(UnaryOp::Sqrt),
            "exp" => Some(UnaryOp::Exp),
            "log" => Some(UnaryOp::Log),
            "sin" => Some(UnaryOp::Sin),
            "cos" => Some(UnaryOp::Cos),
            "tan" => Some(UnaryOp::Tan),
            "tanh" => Some(UnaryOp::Tanh),
            _ => None,
        }
    }

    pub fn apply(self, a: f64) -> f64 {
        match self {
            UnaryOp::Neg => -a,
            UnaryOp::Sqrt => a.sqrt(),
            UnaryOp::Exp => a.exp(),
            UnaryOp::Log => a.ln(),
            UnaryOp::Sin => a.sin(),
            UnaryOp::Cos => a.cos(),
            UnaryOp::Tan => a.tan(),
            UnaryOp::Tanh => a.tanh(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    pub fn symbol(self) -> char {
        match self {
            BinaryOp::Add => '+',
            BinaryOp::Sub => '-',
            BinaryOp::Mul => '*',
            BinaryOp::Div => '/',
            BinaryOp::Pow => '^',
        }
    }

    pub fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }
}

#[derive(Debug)]
pub enum SxKind {
    Constant(f64),
    Symbol(String),
    Unary(UnaryOp, Sx),
    Binary(BinaryOp, Sx, Sx),
}

struct SxNode {
    id: usize,
    kind: SxKind,
}

// Long chains are released iteratively: children that would drop to a zero
// count are moved onto a heap stack instead of recursing.
impl Drop for SxNode {
    fn drop(&mut self) {
        let mut pending = Vec::new();
        take_children(&mut self.kind, &mut pending);
        while let Some(child) = pending.pop() {
            if let Ok(mut node) = Rc::try_unwrap(child.0) {
                take_children(&mut node.kind, &mut pending);
            }
        }
    }
}

fn take_children(kind: &mut SxKind, pending: &mut Vec<Sx>) {
    match std::mem::replace(kind, SxKind::Constant(0.0)) {
        SxKind::Unary(_, a) => pending.push(a),
        SxKind::Binary(_, a, b) => {
            pending.push(a);
            pending.push(b);
        }
        _ => {}
    }
}

#[derive(Clone)]
pub struct Sx(Rc<SxNode>);

impl Sx {
    fn from_kind(kind: SxKind) -> Self {
        Sx(Rc::new(SxNode {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
        }))
    }

    /// Creates a fresh leaf symbol.
    pub fn sym(name: impl Into<String>) -> Self {
        Self::from_kind(SxKind::Symbol(name.into()))
    }

    pub fn constant(value: f64) -> Self {
        Self::from_kind(SxKind::Constant(value))
    }

    pub fn zero() -> Self {
        Self::constant(0.0)
    }

    pub fn one() -> Self {
        Self::constant(1.0)
    }

    pub fn id(&self) -> usize {
        self.0.id
    }

    pub fn kind(&self) -> &SxKind {
        &self.0.kind
    }

    /// True for leaf symbols.
    pub fn is_symbolic(&self) -> bool {
        matches!(self.kind(), SxKind::Symbol(_))
    }

    /// Name of a leaf symbol, `None` for every other node.
    pub fn name(&self) -> Option<&str> {
        match self.kind() {
            SxKind::Symbol(name) => Some(name),
            _ => None,
        }
    }

    pub fn constant_value(&self) -> Option<f64> {
        match self.kind() {
            SxKind::Constant(value) => Some(*value),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.constant_value() == Some(0.0)
    }

    pub fn is_one(&self) -> bool {
        self.constant_value() == Some(1.0)
    }

    fn is_minus_one(&self) -> bool {
        self.constant_value() == Some(-1.0)
    }

    /// Node identity.
    pub fn is_equal(&self, other: &Sx) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn unary(op: UnaryOp, a: &Sx) -> Sx {
        if let Some(value) = a.constant_value() {
            return Sx::constant(op.apply(value));
        }
        if op == UnaryOp::Neg {
            if let SxKind::Unary(UnaryOp::Neg, inner) = a.kind() {
                return inner.clone();
            }
        }
        Sx::from_kind(SxKind::Unary(op, a.clone()))
    }

    pub fn binary(op: BinaryOp, a: &Sx, b: &Sx) -> Sx {
        if let (Some(x), Some(y)) = (a.constant_value(), b.constant_value()) {
            return Sx::constant(op.apply(x, y));
        }
        match op {
            BinaryOp::Add => {
                if a.is_zero() {
                    return b.clone();
                }
                if b.is_zero() {
                    return a.clone();
                }
            }
            BinaryOp::Sub => {
                if b.is_zero() {
                    return a.clone();
                }
                if a.is_zero() {
                    return Sx::unary(UnaryOp::Neg, b);
                }
                if a.is_equal(b) {
                    return Sx::zero();
                }
            }
            BinaryOp::Mul => {
                if a.is_zero() || b.is_zero() {
                    return Sx::zero();
                }
                if a.is_one() {
                    return b.clone();
                }
                if b.is_one() {
                    return a.clone();
                }
                if a.is_minus_one() {
                    return Sx::unary(UnaryOp::Neg, b);
                }
                if b.is_minus_one() {
                    return Sx::unary(UnaryOp::Neg, a);
                }
            }
            BinaryOp::Div => {
                if a.is_zero() {
                    return Sx::zero();
                }
                if b.is_one() {
                    return a.clone();
                }
                if b.is_minus_one() {
                    return Sx::unary(UnaryOp::Neg, a);
                }
            }
            BinaryOp::Pow => {
                if b.is_zero() {
                    return Sx::one();
                }
                if b.is_one() {
                    return a.clone();
                }
            }
        }
        Sx::from_kind(SxKind::Binary(op, a.clone(), b.clone()))
    }

    pub fn sqrt(&self) -> Sx {
        Sx::unary(UnaryOp::Sqrt, self)
    }

    pub fn exp(&self) -> Sx {
        Sx::unary(UnaryOp::Exp, self)
    }

    pub fn ln(&self) -> Sx {
        Sx::unary(UnaryOp::Log, self)
    }

    pub fn sin(&self) -> Sx {
        Sx::unary(UnaryOp::Sin, self)
    }

    pub fn cos(&self) -> Sx {
        Sx::unary(UnaryOp::Cos, self)
    }

    pub fn tan(&self) -> Sx {
        Sx::unary(UnaryOp::Tan, self)
    }

    pub fn tanh(&self) -> Sx {
        Sx::unary(UnaryOp::Tanh, self)
    }

    pub fn pow(&self, exponent: &Sx) -> Sx {
        Sx::binary(BinaryOp::Pow, self, exponent)
    }

    /// Derivative with respect to the leaf symbol `wrt`.
    ///
    /// `memo` caches results per node id and must only be reused for the same
    /// `wrt`.
    pub fn differentiate(&self, wrt: &Sx, memo: &mut HashMap<usize, Sx>) -> Sx {
        let mut stack = vec![(self.clone(), false)];
        while let Some((expr, expanded)) = stack.pop() {
            if memo.contains_key(&expr.id()) {
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
            let result = expr.derivative_step(wrt, memo);
            memo.insert(expr.id(), result);
        }
        memo.get(&self.id()).cloned().unwrap_or_else(Sx::zero)
    }

    /// Derivative of one node given the derivatives of its children in `memo`.
    fn derivative_step(&self, wrt: &Sx, memo: &HashMap<usize, Sx>) -> Sx {
        let d = |e: &Sx| memo.get(&e.id()).cloned().unwrap_or_else(Sx::zero);
        match self.kind() {
            SxKind::Constant(_) => Sx::zero(),
            SxKind::Symbol(_) => {
                if self.is_equal(wrt) {
                    Sx::one()
                } else {
                    Sx::zero()
                }
            }
            SxKind::Unary(op, a) => {
                let da = d(a);
                if da.is_zero() {
                    return Sx::zero();
                }
                match op {
                    UnaryOp::Neg => -&da,
                    UnaryOp::Sqrt => &da / (2.0 * self),
                    UnaryOp::Exp => &da * self,
                    UnaryOp::Log => &da / a,
                    UnaryOp::Sin => &da * a.cos(),
                    UnaryOp::Cos => -(&da * a.sin()),
                    UnaryOp::Tan => &da * (1.0 + self * self),
                    UnaryOp::Tanh => &da * (1.0 - self * self),
                }
            }
            SxKind::Binary(op, a, b) => {
                let da = d(a);
                let db = d(b);
                match op {
                    BinaryOp::Add => &da + &db,
                    BinaryOp::Sub => &da - &db,
                    BinaryOp::Mul => &da * b + a * &db,
                    BinaryOp::Div => (&da - self * &db) / b,
                    BinaryOp::Pow => {
                        if db.is_zero() {
                            b * a.pow(&(b - 1.0)) * &da
                        } else {
                            self * (&db * a.ln() + b * &da / a)
                        }
                    }
                }
            }
        }
    }
}

/// True if any expression in `exprs` structurally contains any of `symbols`.
pub fn depends_on(exprs: &[Sx], symbols: &[Sx]) -> bool {
    let targets: HashSet<usize> = symbols.iter().map(Sx::id).collect();
    if targets.is_empty() {
        return false;
    }
    let mut visited = HashSet::new();
    let mut stack: Vec<&Sx> = exprs.iter().collect();
    while let Some(expr) = stack.pop() {
        if !visited.insert(expr.id()) {
            continue;
        }
        match expr.kind() {
            SxKind::Constant(_) => {}
            SxKind::Symbol(_) => {
                if targets.contains(&expr.id()) {
                    return true;
                }
            }
            SxKind::Unary(_, a) => stack.push(a),
            SxKind::Binary(_, a, b) => {
                stack.push(a);
                stack.push(b);
            }
        }
    }
    false
}

/// Free symbols of `exprs`, in order of first occurrence.
pub fn symvar(exprs: &[Sx]) -> Vec<Sx> {
    let mut visited = HashSet::new();
    let mut found = Vec::new();
    let mut stack: Vec<&Sx> = exprs.iter().rev().collect();
    while let Some(expr) = stack.pop() {
        if !visited.insert(expr.id()) {
            continue;
        }
        match expr.kind() {
            SxKind::Constant(_) => {}
            SxKind::Symbol(_) => found.push(expr.clone()),
            SxKind::Unary(_, a) => stack.push(a),
            SxKind::Binary(_, a, b) => {
                stack.push(b);
                stack.push(a);
            }
        }
    }
    found
}

impl PartialEq for Sx {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl From<f64> for Sx {
    fn from(value: f64) -> Self {
        Sx::constant(value)
    }
}

impl fmt::Display for Sx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        enum Piece<'a> {
            Node(&'a Sx),
            Text(&'static str),
            Op(char),
        }
        let mut stack = vec![Piece::Node(self)];
        while let Some(piece) = stack.pop() {
            match piece {
                Piece::Text(text) => f.write_str(text)?,
                Piece::Op(op) => write!(f, "{op}")?,
                Piece::Node(expr) => match expr.kind() {
                    SxKind::Constant(value) => write!(f, "{value}")?,
                    SxKind::Symbol(name) => f.write_str(name)?,
                    SxKind::Unary(op, a) => {
                        if *op == UnaryOp::Neg {
                            f.write_str("(-")?;
                        } else {
                            write!(f, "{}(", op.name())?;
                        }
                        stack.push(Piece::Text(")"));
                        stack.push(Piece::Node(a));
                    }
                    SxKind::Binary(op, a, b) => {
                        f.write_str("(")?;
                        stack.push(Piece::Text(")"));
                        stack.push(Piece::Node(b));
                        stack.push(Piece::Op(op.symbol()));
                        stack.push(Piece::Node(a));
                    }
                },
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Sx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl Neg for &Sx {
    type Output = Sx;
    fn neg(self) -> Sx {
        Sx::unary(UnaryOp::Neg, self)
    }
}

impl Neg for Sx {
    type Output = Sx;
    fn neg(self) -> Sx {
        Sx::unary(UnaryOp::Neg, &self)
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl $trait<&Sx> for &Sx {
            type Output = Sx;
            fn $method(self, rhs: &Sx) -> Sx {
                Sx::binary($op, self, rhs)
            }
        }

        impl $trait<Sx> for Sx {
            type Output = Sx;
            fn $method(self, rhs: Sx) -> Sx {
                Sx::binary($op, &self, &rhs)
            }
        }

        impl $trait<&Sx> for Sx {
            type Output = Sx;
            fn $method(self, rhs: &Sx) -> Sx {
                Sx::binary($op, &self, rhs)
            }
        }

        impl $trait<Sx> for &Sx {
            type Output = Sx;
            fn $method(self, rhs: Sx) -> Sx {
                Sx::binary($op, self, &rhs)
            }
        }

        impl $trait<f64> for Sx {
            type Output = Sx;
            fn $method(self, rhs: f64) -> Sx {
                Sx::binary($op, &self, &Sx::constant(rhs))
            }
        }

        impl $trait<f64> for &Sx {
            type Output = Sx;
            fn $method(self, rhs: f64) -> Sx {
                Sx::binary($op, self, &Sx::constant(rhs))
            }
        }

        impl $trait<Sx> for f64 {
            type Output = Sx;
            fn $method(self, rhs: Sx) -> Sx {
                Sx::binary($op, &Sx::constant(self), &rhs)
            }
        }

        impl $trait<&Sx> for f64 {
            type Output = Sx;
            fn $method(self, rhs: &Sx) -> Sx {
                Sx::binary($op, &Sx::constant(self), rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, BinaryOp::Add);
impl_binary_op!(Sub, sub, BinaryOp::Sub);
impl_binary_op!(Mul, mul, BinaryOp::Mul);
impl_binary_op!(Div, div, BinaryOp::Div);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbols_are_distinct_by_identity() {
        let a = Sx::sym("x");
        let b = Sx::sym("x");
        assert!(!a.is_equal(&b));
        assert!(a.is_equal(&a.clone()));
        assert_eq!(a.name(), Some("x"));
    }

    #[test]
    fn construction_folds_constants_and_identities() {
        let x = Sx::sym("x");
        assert_eq!((Sx::constant(2.0) * 3.0).constant_value(), Some(6.0));
        assert!((&x + 0.0).is_equal(&x));
        assert!((1.0 * &x).is_equal(&x));
        assert!((0.0 * &x).is_zero());
        assert!((&x - &x).is_zero());
        assert!((-(-&x)).is_equal(&x));
        assert!((&x / 1.0).is_equal(&x));
    }

    #[test]
    fn derivative_of_affine_unknown_is_constant() {
        let z = Sx::sym("z");
        let x = Sx::sym("x");
        let residual = &z - (&x + 1.0);
        let d = residual.differentiate(&z, &mut HashMap::new());
        assert!(d.is_one());
    }

    #[test]
    fn derivative_of_product_keeps_dependency() {
        let z = Sx::sym("z");
        let d = (&z * &z - 1.0).differentiate(&z, &mut HashMap::new());
        assert!(depends_on(&[d], &[z]));
    }

    #[test]
    fn depends_on_and_symvar_walk_shared_nodes() {
        let x = Sx::sym("x");
        let y = Sx::sym("y");
        let shared = &x * &y;
        let e = &shared + shared.sin();
        assert!(depends_on(&[e.clone()], &[y.clone()]));
        assert!(!depends_on(&[e.clone()], &[Sx::sym("y")]));
        let free = symvar(&[e]);
        assert_eq!(free.len(), 2);
        assert!(free[0].is_equal(&x));
        assert!(free[1].is_equal(&y));
    }

    #[test]
    fn deep_chains_are_walked_without_recursion() {
        let x = Sx::sym("x");
        let mut e = x.clone();
        for _ in 1..20_000 {
            e = &e + &x;
        }
        let d = e.differentiate(&x, &mut HashMap::new());
        assert_eq!(d.constant_value(), Some(20_000.0));
        let text = e.to_string();
        assert_eq!(text.matches('(').count(), 19_999);
        assert!(text.ends_with("+x)"));
        drop(e);
    }

    #[test]
    fn display_is_infix() {
        let x = Sx::sym("x");
        let a = Sx::sym("a");
        assert_eq!(format!("{}", -(&a * &x)), "(-(a*x))");
        assert_eq!(format!("{}", x.sin() + 2.0), "(sin(x)+2)");
    }
}
