use crate::error::{OcpError, Result};
use crate::sx::{BinaryOp, Sx, SxKind, UnaryOp};
use crate::traits::{DynamicalSystem, Scalar, SymbolScope};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

/// OpCodes for the Stack-based Virtual Machine.
/// The VM operates on a stack of `Scalar` values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Pushes a constant `f64` value onto the stack.
    LoadConst(f64),
    /// Pushes the value of an input (by index) onto the stack.
    LoadVar(usize),
    /// Pushes a previously stored shared subexpression.
    LoadTemp(usize),
    /// Copies the top of the stack into a temporary slot, leaving it in place.
    StoreTemp(usize),
    /// Pops top two values (b, a), pushes (a + b).
    Add,
    /// Pops top two values (b, a), pushes (a - b).
    Sub,
    /// Pops top two values (b, a), pushes (a * b).
    Mul,
    /// Pops top two values (b, a), pushes (a / b).
    Div,
    /// Pops top two values (b, a), pushes (a ^ b).
    Pow,
    /// Pops top value (a), pushes -a.
    Neg,
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Tan,
    Tanh,
}

/// Represents a compiled sequence of operations.
#[derive(Debug, Clone, Default)]
pub struct Bytecode {
    pub ops: Vec<OpCode>,
    /// Number of temporary slots the program writes.
    pub n_temps: usize,
}

impl Bytecode {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stack-based Virtual Machine for evaluating compiled expressions.
///
/// The VM is stateless; `execute` takes all necessary context:
/// - `bytecode`: Instructions to run.
/// - `vars`: Input vector (read-only).
/// - `stack`, `temps`: Mutable buffers for intermediate computations.
///
/// Returns the result of the evaluation (the value left on the stack).
pub struct VM;

impl VM {
    pub fn execute<T: Scalar>(
        bytecode: &Bytecode,
        vars: &[T],
        stack: &mut Vec<T>,
        temps: &mut Vec<T>,
    ) -> T {
        stack.clear();
        temps.clear();
        temps.resize(bytecode.n_temps, T::nan());

        for op in &bytecode.ops {
            match op {
                OpCode::LoadConst(val) => {
                    stack.push(T::from_f64(*val).unwrap_or_else(T::nan));
                }
                OpCode::LoadVar(idx) => stack.push(vars[*idx]),
                OpCode::LoadTemp(slot) => stack.push(temps[*slot]),
                OpCode::StoreTemp(slot) => {
                    if let Some(top) = stack.last() {
                        temps[*slot] = *top;
                    }
                }
                OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Pow => {
                    let b = stack.pop().unwrap_or_else(T::nan);
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(match op {
                        OpCode::Add => a + b,
                        OpCode::Sub => a - b,
                        OpCode::Mul => a * b,
                        OpCode::Div => a / b,
                        _ => a.powf(b),
                    });
                }
                unary => {
                    let a = stack.pop().unwrap_or_else(T::nan);
                    stack.push(match unary {
                        OpCode::Neg => -a,
                        OpCode::Sqrt => a.sqrt(),
                        OpCode::Exp => a.exp(),
                        OpCode::Log => a.ln(),
                        OpCode::Sin => a.sin(),
                        OpCode::Cos => a.cos(),
                        OpCode::Tan => a.tan(),
                        _ => a.tanh(),
                    });
                }
            }
        }

        // The result is the last item on the stack. Empty programs never come out of the compiler.
        stack.pop().unwrap_or_else(T::nan)
    }
}

/// Compiles `Sx` expressions into `Bytecode`.
/// Resolves input symbols to indices; shared subexpressions are evaluated once.
pub struct Compiler {
    pub var_map: HashMap<usize, usize>,
}

impl Compiler {
    pub fn new(inputs: &[Sx]) -> Self {
        let var_map = inputs
            .iter()
            .enumerate()
            .map(|(i, input)| (input.id(), i))
            .collect();
        Self { var_map }
    }

    pub fn compile(&self, expr: &Sx) -> Result<Bytecode> {
        let shared = shared_nodes(expr);
        let mut temps = HashMap::new();
        let mut ops = Vec::new();
        self.emit(expr, &shared, &mut temps, &mut ops)?;
        Ok(Bytecode {
            ops,
            n_temps: temps.len(),
        })
    }

    /// Appends the postfix program for `expr` to `ops`. Operands are visited
    /// with an explicit stack so deep chains do not exhaust the call stack.
    fn emit(
        &self,
        expr: &Sx,
        shared: &HashSet<usize>,
        temps: &mut HashMap<usize, usize>,
        ops: &mut Vec<OpCode>,
    ) -> Result<()> {
        enum Step<'e> {
            Visit(&'e Sx),
            Apply(&'e Sx),
        }

        let mut steps = vec![Step::Visit(expr)];
        while let Some(step) = steps.pop() {
            match step {
                Step::Visit(node) => {
                    if let Some(&slot) = temps.get(&node.id()) {
                        ops.push(OpCode::LoadTemp(slot));
                        continue;
                    }
                    match node.kind() {
                        SxKind::Constant(value) => ops.push(OpCode::LoadConst(*value)),
                        SxKind::Symbol(name) => match self.var_map.get(&node.id()) {
                            Some(&idx) => ops.push(OpCode::LoadVar(idx)),
                            None => return Err(OcpError::UnknownVariable(name.clone())),
                        },
                        SxKind::Unary(_, a) => {
                            steps.push(Step::Apply(node));
                            steps.push(Step::Visit(a));
                        }
                        SxKind::Binary(_, a, b) => {
                            steps.push(Step::Apply(node));
                            steps.push(Step::Visit(b));
                            steps.push(Step::Visit(a));
                        }
                    }
                }
                Step::Apply(node) => {
                    match node.kind() {
                        SxKind::Unary(op, _) => ops.push(match op {
                            UnaryOp::Neg => OpCode::Neg,
                            UnaryOp::Sqrt => OpCode::Sqrt,
                            UnaryOp::Exp => OpCode::Exp,
                            UnaryOp::Log => OpCode::Log,
                            UnaryOp::Sin => OpCode::Sin,
                            UnaryOp::Cos => OpCode::Cos,
                            UnaryOp::Tan => OpCode::Tan,
                            UnaryOp::Tanh => OpCode::Tanh,
                        }),
                        SxKind::Binary(op, _, _) => ops.push(match op {
                            BinaryOp::Add => OpCode::Add,
                            BinaryOp::Sub => OpCode::Sub,
                            BinaryOp::Mul => OpCode::Mul,
                            BinaryOp::Div => OpCode::Div,
                            BinaryOp::Pow => OpCode::Pow,
                        }),
                        _ => {}
                    }
                    if shared.contains(&node.id()) {
                        let slot = temps.len();
                        temps.insert(node.id(), slot);
                        ops.push(OpCode::StoreTemp(slot));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Operation nodes referenced from more than one parent.
fn shared_nodes(root: &Sx) -> HashSet<usize> {
    let mut parents: HashMap<usize, usize> = HashMap::new();
    let mut visited = HashSet::new();
    let mut stack = vec![root];
    while let Some(expr) = stack.pop() {
        if !visited.insert(expr.id()) {
            continue;
        }
        let children: [Option<&Sx>; 2] = match expr.kind() {
            SxKind::Unary(_, a) => [Some(a), None],
            SxKind::Binary(_, a, b) => [Some(a), Some(b)],
            _ => [None, None],
        };
        for child in children.into_iter().flatten() {
            if matches!(child.kind(), SxKind::Unary(..) | SxKind::Binary(..)) {
                *parents.entry(child.id()).or_insert(0) += 1;
            }
            stack.push(child);
        }
    }
    parents
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(id, _)| id)
        .collect()
}

/// A set of compiled outputs sharing one input vector.
pub struct CompiledFunction<T: Scalar> {
    pub programs: Vec<Bytecode>,
    n_in: usize,
    // Interior mutability for VM buffers to avoid allocation per evaluation.
    // Note: This makes the function !Sync.
    stack: RefCell<Vec<T>>,
    temps: RefCell<Vec<T>>,
}

impl<T: Scalar> CompiledFunction<T> {
    pub fn new(programs: Vec<Bytecode>, n_in: usize) -> Self {
        Self {
            programs,
            n_in,
            stack: RefCell::new(Vec::with_capacity(64)),
            temps: RefCell::new(Vec::new()),
        }
    }

    pub fn n_in(&self) -> usize {
        self.n_in
    }

    pub fn n_out(&self) -> usize {
        self.programs.len()
    }

    pub fn eval(&self, inputs: &[T]) -> Result<Vec<T>> {
        let mut out = vec![T::zero(); self.n_out()];
        self.eval_into(inputs, &mut out)?;
        Ok(out)
    }

    pub fn eval_into(&self, inputs: &[T], out: &mut [T]) -> Result<()> {
        if inputs.len() != self.n_in || out.len() != self.n_out() {
            return Err(OcpError::DimensionMismatch(format!(
                "expected {} inputs and {} outputs, got {} and {}",
                self.n_in,
                self.n_out(),
                inputs.len(),
                out.len()
            )));
        }
        self.run(inputs, out);
        Ok(())
    }

    fn run(&self, inputs: &[T], out: &mut [T]) {
        let mut stack = self.stack.borrow_mut();
        let mut temps = self.temps.borrow_mut();
        for (i, program) in self.programs.iter().enumerate() {
            out[i] = VM::execute(program, inputs, &mut stack, &mut temps);
        }
    }
}

/// Explicit ODE right-hand side with parameters and controls held fixed.
///
/// Input layout of the compiled function is `[t, states.., fixed..]`.
pub struct ExplicitOde {
    function: CompiledFunction<f64>,
    fixed: Vec<f64>,
    buffer: RefCell<Vec<f64>>,
}

impl ExplicitOde {
    pub fn new(
        t: &Sx,
        states: &[Sx],
        rhs: &[Sx],
        fixed_symbols: &[Sx],
        fixed_values: &[f64],
    ) -> Result<Self> {
        if states.len() != rhs.len() {
            return Err(OcpError::DimensionMismatch(format!(
                "{} states but {} right-hand sides",
                states.len(),
                rhs.len()
            )));
        }
        if fixed_symbols.len() != fixed_values.len() {
            return Err(OcpError::DimensionMismatch(format!(
                "{} fixed symbols but {} values",
                fixed_symbols.len(),
                fixed_values.len()
            )));
        }
        let mut inputs = Vec::with_capacity(1 + states.len() + fixed_symbols.len());
        inputs.push(t.clone());
        inputs.extend_from_slice(states);
        inputs.extend_from_slice(fixed_symbols);
        let function = crate::function::SxFunction::new(&inputs, rhs)?.compile()?;
        Ok(Self {
            function,
            fixed: fixed_values.to_vec(),
            buffer: RefCell::new(vec![0.0; inputs.len()]),
        })
    }
}

impl DynamicalSystem<f64> for ExplicitOde {
    fn dimension(&self) -> usize {
        self.function.n_out()
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        debug_assert_eq!(x.len(), self.dimension());
        let mut buffer = self.buffer.borrow_mut();
        buffer[0] = t;
        buffer[1..=x.len()].copy_from_slice(x);
        buffer[1 + x.len()..].copy_from_slice(&self.fixed);
        self.function.run(&buffer, out);
    }
}

// --- AST & Parser ---

/// Abstract Syntax Tree nodes for expression text.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Binary(Box<Expr>, char, Box<Expr>), // char is operator +, -, *, /, ^
    Unary(char, Box<Expr>),             // -
    Call(String, Box<Expr>),            // functions like sin(x), der(x)
}

impl Expr {
    /// Builds the symbolic expression, resolving names through `scope`.
    pub fn to_sx(&self, scope: &dyn SymbolScope) -> Result<Sx> {
        match self {
            Expr::Number(n) => Ok(Sx::constant(*n)),
            Expr::Variable(name) => scope.symbol(name),
            Expr::Binary(left, op, right) => {
                let a = left.to_sx(scope)?;
                let b = right.to_sx(scope)?;
                match op {
                    '+' => Ok(a + b),
                    '-' => Ok(a - b),
                    '*' => Ok(a * b),
                    '/' => Ok(a / b),
                    '^' => Ok(a.pow(&b)),
                    _ => Err(OcpError::Parse(format!("unknown binary operator: {op}"))),
                }
            }
            Expr::Unary(op, operand) => match op {
                '-' => Ok(-operand.to_sx(scope)?),
                _ => Err(OcpError::Parse(format!("unknown unary operator: {op}"))),
            },
            Expr::Call(func, arg) => {
                if func == "der" {
                    return match arg.as_ref() {
                        Expr::Variable(name) => scope.derivative(name),
                        other => Err(OcpError::Parse(format!(
                            "der() expects a variable name, got {other:?}"
                        ))),
                    };
                }
                match UnaryOp::from_name(func) {
                    Some(op) => Ok(Sx::unary(op, &arg.to_sx(scope)?)),
                    None => Err(OcpError::Parse(format!("unknown function: {func}"))),
                }
            }
        }
    }
}

/// Parses expression text into an AST.
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expression()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(OcpError::Parse(format!(
            "unexpected trailing token {token:?} in \"{input}\""
        ))),
    }
}

/// Parses expression text straight to a symbolic expression.
pub fn parse_sx(input: &str, scope: &dyn SymbolScope) -> Result<Sx> {
    parse(input)?.to_sx(scope)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c.is_ascii_digit() || c == '.' {
            let mut num_str = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_ascii_digit() || d == '.' {
                    num_str.push(d);
                    chars.next();
                } else if (d == 'e' || d == 'E') && !num_str.contains(['e', 'E']) {
                    num_str.push(d);
                    chars.next();
                    if let Some(&sign) = chars.peek() {
                        if sign == '+' || sign == '-' {
                            num_str.push(sign);
                            chars.next();
                        }
                    }
                } else {
                    break;
                }
            }
            let value = num_str
                .parse()
                .map_err(|_| OcpError::Parse(format!("invalid number literal \"{num_str}\"")))?;
            tokens.push(Token::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let mut ident = String::new();
            while let Some(&d) = chars.peek() {
                if d.is_alphanumeric() || d == '_' || d == '.' {
                    ident.push(d);
                    chars.next();
                } else {
                    break;
                }
            }
            tokens.push(Token::Identifier(ident));
        } else {
            tokens.push(match c {
                '+' => Token::Plus,
                '-' => Token::Minus,
                '*' => Token::Star,
                '/' => Token::Slash,
                '^' => Token::Caret,
                '(' => Token::LParen,
                ')' => Token::RParen,
                _ => {
                    return Err(OcpError::Parse(format!(
                        "unexpected character '{c}' in \"{input}\""
                    )))
                }
            });
            chars.next();
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.pos).cloned()
    }

    fn consume(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_term()
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut left = self.parse_factor()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Plus => '+',
                Token::Minus => '-',
                _ => break,
            };
            self.consume();
            let right = self.parse_factor()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let op = match token {
                Token::Star => '*',
                Token::Slash => '/',
                _ => break,
            };
            self.consume();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // Unary minus binds looser than '^', so -x^2 is -(x^2).
    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let expr = self.parse_unary()?;
            return Ok(Expr::Unary('-', Box::new(expr)));
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            // Right associative: a^b^c is a^(b^c).
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(Box::new(base), '^', Box::new(exponent)));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Identifier(name)) => {
                if let Some(Token::LParen) = self.peek() {
                    self.consume(); // eat '('
                    let arg = self.parse_expression()?;
                    if let Some(Token::RParen) = self.consume() {
                        Ok(Expr::Call(name, Box::new(arg)))
                    } else {
                        Err(OcpError::Parse("expected ')'".to_string()))
                    }
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                if let Some(Token::RParen) = self.consume() {
                    Ok(expr)
                } else {
                    Err(OcpError::Parse("expected ')'".to_string()))
                }
            }
            Some(token) => Err(OcpError::Parse(format!("unexpected token {token:?}"))),
            None => Err(OcpError::Parse("unexpected end of input".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Names(HashMap<String, Sx>);

    impl SymbolScope for Names {
        fn symbol(&self, name: &str) -> Result<Sx> {
            self.0
                .get(name)
                .cloned()
                .ok_or_else(|| OcpError::UnknownVariable(name.to_string()))
        }

        fn derivative(&self, name: &str) -> Result<Sx> {
            self.symbol(&format!("der({name})"))
        }
    }

    fn scope(names: &[&str]) -> (Names, Vec<Sx>) {
        let symbols: Vec<Sx> = names.iter().map(|n| Sx::sym(*n)).collect();
        let map = names
            .iter()
            .map(|n| n.to_string())
            .zip(symbols.iter().cloned())
            .collect();
        (Names(map), symbols)
    }

    fn eval(text: &str, names: &[&str], values: &[f64]) -> f64 {
        let (scope, symbols) = scope(names);
        let expr = parse_sx(text, &scope).expect("expression should parse");
        let compiled = Compiler::new(&symbols).compile(&expr).expect("should compile");
        let mut stack = Vec::new();
        let mut temps = Vec::new();
        VM::execute(&compiled, values, &mut stack, &mut temps)
    }

    #[test]
    fn operator_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[], &[]), 7.0);
        assert_eq!(eval("-2^2", &[], &[]), -4.0);
        assert_eq!(eval("2^3^2", &[], &[]), 512.0);
        assert_eq!(eval("(1 + 2) * 3 - 4 / 2", &[], &[]), 7.0);
        assert!((eval("1.5e-3 * 2", &[], &[]) - 3e-3).abs() < 1e-15);
    }

    #[test]
    fn resolves_names_and_functions() {
        let value = eval("a * sin(x) + exp(0)", &["a", "x"], &[2.0, 0.5]);
        assert!((value - (2.0 * 0.5_f64.sin() + 1.0)).abs() < 1e-12);
        let value = eval("der(x) - x", &["x", "der(x)"], &[1.0, 3.0]);
        assert_eq!(value, 2.0);
    }

    #[test]
    fn rejects_malformed_text() {
        let (scope, _) = scope(&["x"]);
        assert!(matches!(parse("x +"), Err(OcpError::Parse(_))));
        assert!(matches!(parse("x $ 1"), Err(OcpError::Parse(_))));
        assert!(matches!(parse("(x"), Err(OcpError::Parse(_))));
        assert!(matches!(parse("x y"), Err(OcpError::Parse(_))));
        assert!(matches!(
            parse_sx("foo(x)", &scope),
            Err(OcpError::Parse(_))
        ));
        assert!(matches!(
            parse_sx("y + 1", &scope),
            Err(OcpError::UnknownVariable(_))
        ));
    }

    #[test]
    fn shared_subexpressions_are_stored_once() {
        let x = Sx::sym("x");
        let shared = (&x + 1.0).sin();
        let expr = &shared * &shared + &shared;
        let compiled = Compiler::new(&[x]).compile(&expr).expect("should compile");
        assert_eq!(compiled.n_temps, 1);
        let sin_count = compiled
            .ops
            .iter()
            .filter(|op| matches!(op, OpCode::Sin))
            .count();
        assert_eq!(sin_count, 1);
        let mut stack = Vec::new();
        let mut temps = Vec::new();
        let value = VM::execute(&compiled, &[0.3], &mut stack, &mut temps);
        let s = 1.3_f64.sin();
        assert!((value - (s * s + s)).abs() < 1e-12);
    }

    #[test]
    fn deep_chains_compile_and_evaluate() {
        let x = Sx::sym("x");
        let mut expr = x.clone();
        for _ in 1..20_000 {
            expr = &expr + &x;
        }
        let compiled = Compiler::new(&[x]).compile(&expr).expect("should compile");
        let mut stack = Vec::new();
        let mut temps = Vec::new();
        assert_eq!(VM::execute(&compiled, &[1.0], &mut stack, &mut temps), 20_000.0);
    }

    #[test]
    fn explicit_ode_evaluates_vector_field() {
        let t = Sx::sym("t");
        let x = Sx::sym("x");
        let a = Sx::sym("a");
        let ode = ExplicitOde::new(&t, &[x.clone()], &[-(&a * &x) + &t], &[a], &[3.0])
            .expect("ode should build");
        assert_eq!(ode.dimension(), 1);
        let mut out = [0.0];
        ode.apply(0.5, &[2.0], &mut out);
        assert!((out[0] - (-6.0 + 0.5)).abs() < 1e-12);
    }
}
