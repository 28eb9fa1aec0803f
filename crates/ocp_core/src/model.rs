//! The flat optimal control model.
//!
//! Variables and equations are grouped by role in co-indexed vectors:
//!
//! | variables        | equations | meaning                                  |
//! |------------------|-----------|------------------------------------------|
//! | `x`              | `ode`     | explicit states, `der(x) == ode`         |
//! | `s`, `sdot`      | `dae`     | implicit states, `0 == dae`              |
//! | `z`              | `alg`     | algebraic variables, `0 == alg`          |
//! | `q`              | `quad`    | quadrature states, `der(q) == quad`      |
//! | `i`              | `idef`    | intermediates, `i == idef`               |
//! | `y`              | `ydef`    | outputs, `y == ydef`                     |
//!
//! plus unpaired `init`, `mterm`, `lterm`, the free parameters `p`, the
//! controls `u` and the time horizon. The pipeline transformations in
//! [`crate::pipeline`] rewrite these vectors in place.

use std::fmt;

use crate::equation_engine::ExplicitOde;
use crate::error::{OcpError, Result};
use crate::registry::VariableRegistry;
use crate::sx::Sx;
use crate::traits::SymbolScope;
use crate::variable::{Attribute, Variable};

/// Role of a variable vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableRole {
    X,
    S,
    Z,
    Q,
    I,
    Y,
    P,
    U,
}

/// Role of an equation vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationRole {
    Ode,
    Dae,
    Alg,
    Quad,
    Idef,
    Ydef,
    Init,
    Mterm,
    Lterm,
}

#[derive(Debug, Clone)]
pub struct FlatModel {
    /// Independent variable.
    pub t: Sx,
    pub x: Vec<Sx>,
    pub ode: Vec<Sx>,
    pub s: Vec<Sx>,
    pub sdot: Vec<Sx>,
    pub dae: Vec<Sx>,
    pub z: Vec<Sx>,
    pub alg: Vec<Sx>,
    pub q: Vec<Sx>,
    pub quad: Vec<Sx>,
    pub i: Vec<Sx>,
    pub idef: Vec<Sx>,
    pub y: Vec<Sx>,
    pub ydef: Vec<Sx>,
    pub init: Vec<Sx>,
    pub mterm: Vec<Sx>,
    pub lterm: Vec<Sx>,
    pub p: Vec<Sx>,
    pub u: Vec<Sx>,
    pub t0: f64,
    pub tf: f64,
    pub t0_guess: f64,
    pub tf_guess: f64,
    pub t0_free: bool,
    pub tf_free: bool,
    /// Time points.
    pub tp: Vec<f64>,
    registry: VariableRegistry,
}

impl Default for FlatModel {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatModel {
    pub fn new() -> Self {
        Self {
            t: Sx::sym("t"),
            x: Vec::new(),
            ode: Vec::new(),
            s: Vec::new(),
            sdot: Vec::new(),
            dae: Vec::new(),
            z: Vec::new(),
            alg: Vec::new(),
            q: Vec::new(),
            quad: Vec::new(),
            i: Vec::new(),
            idef: Vec::new(),
            y: Vec::new(),
            ydef: Vec::new(),
            init: Vec::new(),
            mterm: Vec::new(),
            lterm: Vec::new(),
            p: Vec::new(),
            u: Vec::new(),
            t0: f64::NAN,
            tf: f64::NAN,
            t0_guess: f64::NAN,
            tf_guess: f64::NAN,
            t0_free: false,
            tf_free: false,
            tp: Vec::new(),
            registry: VariableRegistry::new(),
        }
    }

    pub fn variables(&self) -> &VariableRegistry {
        &self.registry
    }

    pub fn variables_mut(&mut self) -> &mut VariableRegistry {
        &mut self.registry
    }

    /// Registers a variable and returns its value symbol.
    pub fn register_variable(&mut self, variable: Variable) -> Result<Sx> {
        Ok(self.registry.register(variable)?.v.clone())
    }

    /// Registers a fresh variable with default attributes.
    pub fn add_variable(&mut self, name: &str) -> Result<Sx> {
        self.register_variable(Variable::new(name))
    }

    pub fn add_x(&mut self, name: &str) -> Result<Sx> {
        let v = self.add_variable(name)?;
        self.x.push(v.clone());
        Ok(v)
    }

    /// Returns the value and derivative symbols.
    pub fn add_s(&mut self, name: &str) -> Result<(Sx, Sx)> {
        let var = self.registry.register(Variable::new(name))?;
        let (v, d) = (var.v.clone(), var.d.clone());
        self.s.push(v.clone());
        self.sdot.push(d.clone());
        Ok((v, d))
    }

    pub fn add_z(&mut self, name: &str) -> Result<Sx> {
        let v = self.add_variable(name)?;
        self.z.push(v.clone());
        Ok(v)
    }

    pub fn add_q(&mut self, name: &str) -> Result<Sx> {
        let v = self.add_variable(name)?;
        self.q.push(v.clone());
        Ok(v)
    }

    pub fn add_i(&mut self, name: &str) -> Result<Sx> {
        let v = self.add_variable(name)?;
        self.i.push(v.clone());
        Ok(v)
    }

    pub fn add_y(&mut self, name: &str) -> Result<Sx> {
        let v = self.add_variable(name)?;
        self.y.push(v.clone());
        Ok(v)
    }

    pub fn add_p(&mut self, name: &str) -> Result<Sx> {
        let v = self.add_variable(name)?;
        self.p.push(v.clone());
        Ok(v)
    }

    pub fn add_u(&mut self, name: &str) -> Result<Sx> {
        let v = self.add_variable(name)?;
        self.u.push(v.clone());
        Ok(v)
    }

    pub fn add_ode(&mut self, expr: Sx) {
        self.ode.push(expr);
    }

    pub fn add_dae(&mut self, expr: Sx) {
        self.dae.push(expr);
    }

    pub fn add_alg(&mut self, expr: Sx) {
        self.alg.push(expr);
    }

    pub fn add_quad(&mut self, expr: Sx) {
        self.quad.push(expr);
    }

    pub fn add_idef(&mut self, expr: Sx) {
        self.idef.push(expr);
    }

    pub fn add_ydef(&mut self, expr: Sx) {
        self.ydef.push(expr);
    }

    pub fn add_init(&mut self, expr: Sx) {
        self.init.push(expr);
    }

    pub fn add_mterm(&mut self, expr: Sx) {
        self.mterm.push(expr);
    }

    pub fn add_lterm(&mut self, expr: Sx) {
        self.lterm.push(expr);
    }

    /// Appends the value symbol of a registered variable to a role vector.
    /// Implicit states also get their derivative symbol appended to `sdot`.
    pub fn append_variable(&mut self, role: VariableRole, symbol: &Sx) -> Result<()> {
        let var = self.registry.lookup_symbol(symbol)?;
        let (v, d) = (var.v.clone(), var.d.clone());
        match role {
            VariableRole::X => self.x.push(v),
            VariableRole::S => {
                self.s.push(v);
                self.sdot.push(d);
            }
            VariableRole::Z => self.z.push(v),
            VariableRole::Q => self.q.push(v),
            VariableRole::I => self.i.push(v),
            VariableRole::Y => self.y.push(v),
            VariableRole::P => self.p.push(v),
            VariableRole::U => self.u.push(v),
        }
        Ok(())
    }

    pub fn append_equation(&mut self, role: EquationRole, expr: Sx) {
        self.equations_mut(role).push(expr);
    }

    pub fn equations(&self, role: EquationRole) -> &[Sx] {
        match role {
            EquationRole::Ode => &self.ode,
            EquationRole::Dae => &self.dae,
            EquationRole::Alg => &self.alg,
            EquationRole::Quad => &self.quad,
            EquationRole::Idef => &self.idef,
            EquationRole::Ydef => &self.ydef,
            EquationRole::Init => &self.init,
            EquationRole::Mterm => &self.mterm,
            EquationRole::Lterm => &self.lterm,
        }
    }

    fn equations_mut(&mut self, role: EquationRole) -> &mut Vec<Sx> {
        match role {
            EquationRole::Ode => &mut self.ode,
            EquationRole::Dae => &mut self.dae,
            EquationRole::Alg => &mut self.alg,
            EquationRole::Quad => &mut self.quad,
            EquationRole::Idef => &mut self.idef,
            EquationRole::Ydef => &mut self.ydef,
            EquationRole::Init => &mut self.init,
            EquationRole::Mterm => &mut self.mterm,
            EquationRole::Lterm => &mut self.lterm,
        }
    }

    /// Value symbol of the variable `name`.
    pub fn symbol(&self, name: &str) -> Result<Sx> {
        Ok(self.registry.lookup(name)?.v.clone())
    }

    /// Derivative symbol of the variable `name`.
    pub fn der(&self, name: &str) -> Result<Sx> {
        Ok(self.registry.lookup(name)?.d.clone())
    }

    /// Derivative symbols of a vector of value symbols.
    pub fn der_of(&self, symbols: &[Sx]) -> Result<Vec<Sx>> {
        symbols
            .iter()
            .map(|symbol| {
                if !symbol.is_symbolic() {
                    return Err(OcpError::NonSymbolic(format!("argument to der: {symbol}")));
                }
                Ok(self.registry.lookup_symbol(symbol)?.d.clone())
            })
            .collect()
    }

    pub fn attribute(&self, name: &str, attribute: Attribute, normalized: bool) -> Result<f64> {
        self.registry.attribute(name, attribute, normalized)
    }

    pub fn set_attribute(
        &mut self,
        name: &str,
        attribute: Attribute,
        value: f64,
        normalized: bool,
    ) -> Result<()> {
        self.registry.set_attribute(name, attribute, value, normalized)
    }

    pub fn attributes(
        &self,
        symbols: &[Sx],
        attribute: Attribute,
        normalized: bool,
    ) -> Result<Vec<f64>> {
        self.registry.attributes(symbols, attribute, normalized)
    }

    pub fn set_attributes(
        &mut self,
        symbols: &[Sx],
        attribute: Attribute,
        values: &[f64],
        normalized: bool,
    ) -> Result<()> {
        self.registry.set_attributes(symbols, attribute, values, normalized)
    }

    pub fn nominal(&self, name: &str) -> Result<f64> {
        self.registry.nominal(name)
    }

    pub fn set_nominal(&mut self, name: &str, nominal: f64) -> Result<()> {
        self.registry.set_nominal(name, nominal)
    }

    pub fn nominals(&self, symbols: &[Sx]) -> Result<Vec<f64>> {
        self.registry.nominals(symbols)
    }

    pub fn set_nominals(&mut self, symbols: &[Sx], nominals: &[f64]) -> Result<()> {
        self.registry.set_nominals(symbols, nominals)
    }

    pub fn unit(&self, name: &str) -> Result<&str> {
        self.registry.unit(name)
    }

    pub fn set_unit(&mut self, name: &str, unit: impl Into<String>) -> Result<()> {
        self.registry.set_unit(name, unit)
    }

    pub fn unit_of(&self, symbols: &[Sx]) -> Result<String> {
        self.registry.unit_of(symbols)
    }

    /// Validates the pairing and leaf-symbol invariants of every vector.
    pub fn sanity_check(&self) -> Result<()> {
        if !self.t.is_symbolic() {
            return Err(OcpError::NonSymbolic("time t".into()));
        }
        check_pair("x", &self.x, "ode", &self.ode)?;
        check_pair("s", &self.s, "sdot", &self.sdot)?;
        check_pair("s", &self.s, "dae", &self.dae)?;
        check_pair("z", &self.z, "alg", &self.alg)?;
        check_pair("q", &self.q, "quad", &self.quad)?;
        check_pair("i", &self.i, "idef", &self.idef)?;
        check_pair("y", &self.y, "ydef", &self.ydef)?;
        for (label, symbols) in [
            ("state x", &self.x),
            ("state s", &self.s),
            ("state derivative sdot", &self.sdot),
            ("algebraic variable z", &self.z),
            ("quadrature state q", &self.q),
            ("intermediate variable i", &self.i),
            ("output y", &self.y),
            ("parameter p", &self.p),
            ("control u", &self.u),
        ] {
            if let Some(bad) = symbols.iter().find(|v| !v.is_symbolic()) {
                return Err(OcpError::NonSymbolic(format!("{label}: {bad}")));
            }
        }
        Ok(())
    }

    /// Numerical right-hand side of a fully explicit model. States are
    /// `x` followed by `q`; parameters and controls are held at the given
    /// values.
    pub fn explicit_ode(&self, p_values: &[f64], u_values: &[f64]) -> Result<ExplicitOde> {
        if !self.s.is_empty() || !self.z.is_empty() || !self.i.is_empty() {
            return Err(OcpError::DimensionMismatch(format!(
                "model is not explicit: #s = {}, #z = {}, #i = {}",
                self.s.len(),
                self.z.len(),
                self.i.len()
            )));
        }
        self.sanity_check()?;
        let states: Vec<Sx> = self.x.iter().chain(&self.q).cloned().collect();
        let rhs: Vec<Sx> = self.ode.iter().chain(&self.quad).cloned().collect();
        let fixed: Vec<Sx> = self.p.iter().chain(&self.u).cloned().collect();
        if p_values.len() != self.p.len() || u_values.len() != self.u.len() {
            return Err(OcpError::DimensionMismatch(format!(
                "expected {} parameter and {} control values, got {} and {}",
                self.p.len(),
                self.u.len(),
                p_values.len(),
                u_values.len()
            )));
        }
        let values: Vec<f64> = p_values.iter().chain(u_values).copied().collect();
        ExplicitOde::new(&self.t, &states, &rhs, &fixed, &values)
    }
}

fn check_pair(a_name: &str, a: &[Sx], b_name: &str, b: &[Sx]) -> Result<()> {
    if a.len() != b.len() {
        return Err(OcpError::DimensionMismatch(format!(
            "{a_name} and {b_name} have different lengths ({} vs {})",
            a.len(),
            b.len()
        )));
    }
    Ok(())
}

impl SymbolScope for FlatModel {
    fn symbol(&self, name: &str) -> Result<Sx> {
        if name == "time" {
            return Ok(self.t.clone());
        }
        FlatModel::symbol(self, name)
    }

    fn derivative(&self, name: &str) -> Result<Sx> {
        self.der(name)
    }
}

struct List<'a>(&'a [Sx]);

impl fmt::Display for List<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (k, expr) in self.0.iter().enumerate() {
            if k > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{expr}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for FlatModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Dimensions: #s = {}, #x = {}, #z = {}, #q = {}, #i = {}, #y = {}, #u = {}, #p = {}",
            self.s.len(),
            self.x.len(),
            self.z.len(),
            self.q.len(),
            self.i.len(),
            self.y.len(),
            self.u.len(),
            self.p.len()
        )?;
        writeln!(f)?;
        writeln!(f, "Variables")?;
        writeln!(f, "{{")?;
        writeln!(f, "  t = {}", self.t)?;
        for (label, symbols) in [
            ("s", &self.s),
            ("x", &self.x),
            ("z", &self.z),
            ("q", &self.q),
            ("i", &self.i),
            ("y", &self.y),
            ("u", &self.u),
            ("p", &self.p),
        ] {
            writeln!(f, "  {label} = {}", List(symbols))?;
        }
        writeln!(f, "}}")?;

        let der_label = |v: &Sx| match self.registry.lookup_symbol(v) {
            Ok(var) => var.d.to_string(),
            Err(_) => format!("der({v})"),
        };
        if !self.dae.is_empty() {
            writeln!(f, "Fully-implicit differential-algebraic equations")?;
            for eq in &self.dae {
                writeln!(f, "0 == {eq}")?;
            }
            writeln!(f)?;
        }
        if !self.x.is_empty() {
            writeln!(f, "Differential equations")?;
            for (v, eq) in self.x.iter().zip(&self.ode) {
                writeln!(f, "{} == {eq}", der_label(v))?;
            }
            writeln!(f)?;
        }
        if !self.alg.is_empty() {
            writeln!(f, "Algebraic equations")?;
            for eq in &self.alg {
                writeln!(f, "0 == {eq}")?;
            }
            writeln!(f)?;
        }
        if !self.q.is_empty() {
            writeln!(f, "Quadrature equations")?;
            for (v, eq) in self.q.iter().zip(&self.quad) {
                writeln!(f, "{} == {eq}", der_label(v))?;
            }
            writeln!(f)?;
        }
        if !self.init.is_empty() {
            writeln!(f, "Initial equations")?;
            for eq in &self.init {
                writeln!(f, "0 == {eq}")?;
            }
            writeln!(f)?;
        }
        for (title, vars, defs) in [
            ("Intermediate variables", &self.i, &self.idef),
            ("Output variables", &self.y, &self.ydef),
        ] {
            if !vars.is_empty() {
                writeln!(f, "{title}")?;
                for (v, eq) in vars.iter().zip(defs) {
                    writeln!(f, "{v} == {eq}")?;
                }
                writeln!(f)?;
            }
        }
        for (title, terms) in [
            ("Mayer objective terms", &self.mterm),
            ("Lagrange objective terms", &self.lterm),
        ] {
            if !terms.is_empty() {
                writeln!(f, "{title}")?;
                for term in terms {
                    writeln!(f, "{term}")?;
                }
                writeln!(f)?;
            }
        }
        writeln!(f, "Time horizon")?;
        writeln!(f, "t0 = {}", self.t0)?;
        writeln!(f, "tf = {}", self.tf)?;
        write!(f, "tp = {:?}", self.tp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equation_engine::parse_sx;
    use crate::traits::DynamicalSystem;

    #[test]
    fn add_s_pairs_value_and_derivative() {
        let mut model = FlatModel::new();
        let (s, sdot) = model.add_s("s").expect("fresh name");
        assert!(model.s[0].is_equal(&s));
        assert!(model.sdot[0].is_equal(&sdot));
        assert!(model.der("s").unwrap().is_equal(&sdot));
        assert!(model.der_of(&[s]).unwrap()[0].is_equal(&sdot));
        assert!(matches!(model.add_x("s"), Err(OcpError::DuplicateVariable(_))));
    }

    #[test]
    fn append_variable_requires_registered_symbol() {
        let mut model = FlatModel::new();
        let v = model.add_variable("v").unwrap();
        model.append_variable(VariableRole::S, &v).unwrap();
        assert_eq!(model.sdot.len(), 1);
        assert!(matches!(
            model.append_variable(VariableRole::Z, &Sx::sym("v")),
            Err(OcpError::UnknownVariable(_))
        ));
    }

    #[test]
    fn sanity_check_catches_unpaired_vectors() {
        let mut model = FlatModel::new();
        let x = model.add_x("x").unwrap();
        assert!(matches!(model.sanity_check(), Err(OcpError::DimensionMismatch(_))));
        model.append_equation(EquationRole::Ode, -x.clone());
        model.sanity_check().expect("paired");
        model.u.push(&x * 2.0);
        assert!(matches!(model.sanity_check(), Err(OcpError::NonSymbolic(_))));
    }

    #[test]
    fn parses_against_model_scope() {
        let mut model = FlatModel::new();
        model.add_s("s").unwrap();
        let expr = parse_sx("der(s) + s * time", &model).expect("known names");
        assert_eq!(expr.to_string(), "(der(s)+(s*t))");
        assert!(parse_sx("missing + 1", &model).is_err());
    }

    #[test]
    fn explicit_ode_evaluates_states_and_quadratures() {
        let mut model = FlatModel::new();
        let x = model.add_x("x").unwrap();
        let a = model.add_p("a").unwrap();
        let u = model.add_u("u").unwrap();
        model.add_q("q").unwrap();
        model.add_ode(-(&a * &x) + &u);
        model.add_quad(&x * &x);
        let ode = model.explicit_ode(&[2.0], &[0.5]).expect("explicit");
        assert_eq!(ode.dimension(), 2);
        let mut out = [0.0; 2];
        ode.apply(0.0, &[3.0, 0.0], &mut out);
        assert!((out[0] - (-6.0 + 0.5)).abs() < 1e-12);
        assert!((out[1] - 9.0).abs() < 1e-12);

        model.add_s("s").unwrap();
        assert!(model.explicit_ode(&[2.0], &[0.5]).is_err());
    }

    #[test]
    fn display_lists_equations() {
        let mut model = FlatModel::new();
        let x = model.add_x("x").unwrap();
        model.add_ode(-x.clone());
        model.tf = 10.0;
        let text = model.to_string();
        assert!(text.contains("#x = 1"));
        assert!(text.contains("der(x) == (-x)"));
        assert!(text.contains("tf = 10"));
    }
}
