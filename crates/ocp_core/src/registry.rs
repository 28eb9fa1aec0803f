//! Name-keyed store of every variable in a model.
//!
//! Attribute accessors take a `normalized` flag: reads divide by the
//! variable's nominal value and writes multiply by it, so callers can work
//! in scaled or physical units.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{OcpError, Result};
use crate::sx::Sx;
use crate::variable::{Attribute, Variable};

#[derive(Debug, Clone, Default)]
pub struct VariableRegistry {
    variables: BTreeMap<String, Variable>,
    by_symbol: HashMap<usize, String>,
}

impl VariableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, variable: Variable) -> Result<&Variable> {
        if self.variables.contains_key(&variable.name) {
            return Err(OcpError::DuplicateVariable(variable.name));
        }
        let name = variable.name.clone();
        self.by_symbol.insert(variable.v.id(), name.clone());
        Ok(self.variables.entry(name).or_insert(variable))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn lookup(&self, name: &str) -> Result<&Variable> {
        self.variables
            .get(name)
            .ok_or_else(|| OcpError::UnknownVariable(name.to_string()))
    }

    pub fn lookup_mut(&mut self, name: &str) -> Result<&mut Variable> {
        self.variables
            .get_mut(name)
            .ok_or_else(|| OcpError::UnknownVariable(name.to_string()))
    }

    /// The variable whose value symbol is `symbol`.
    pub fn lookup_symbol(&self, symbol: &Sx) -> Result<&Variable> {
        let name = self
            .by_symbol
            .get(&symbol.id())
            .ok_or_else(|| OcpError::UnknownVariable(symbol.to_string()))?;
        self.lookup(name)
    }

    /// Variables in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Variable> {
        self.variables.values()
    }

    pub fn attribute(&self, name: &str, attribute: Attribute, normalized: bool) -> Result<f64> {
        let var = self.lookup(name)?;
        let value = var.attribute(attribute);
        Ok(if normalized { value / var.nominal } else { value })
    }

    pub fn set_attribute(
        &mut self,
        name: &str,
        attribute: Attribute,
        value: f64,
        normalized: bool,
    ) -> Result<()> {
        let var = self.lookup_mut(name)?;
        let nominal = var.nominal;
        *var.attribute_mut(attribute) = if normalized { value * nominal } else { value };
        Ok(())
    }

    pub fn attributes(
        &self,
        symbols: &[Sx],
        attribute: Attribute,
        normalized: bool,
    ) -> Result<Vec<f64>> {
        self.symbol_names(symbols)?
            .iter()
            .map(|name| self.attribute(name, attribute, normalized))
            .collect()
    }

    pub fn set_attributes(
        &mut self,
        symbols: &[Sx],
        attribute: Attribute,
        values: &[f64],
        normalized: bool,
    ) -> Result<()> {
        let names = self.symbol_names(symbols)?;
        check_values(&names, values)?;
        for (name, &value) in names.iter().zip(values) {
            self.set_attribute(name, attribute, value, normalized)?;
        }
        Ok(())
    }

    pub fn nominal(&self, name: &str) -> Result<f64> {
        Ok(self.lookup(name)?.nominal)
    }

    pub fn set_nominal(&mut self, name: &str, nominal: f64) -> Result<()> {
        self.lookup_mut(name)?.nominal = nominal;
        Ok(())
    }

    pub fn nominals(&self, symbols: &[Sx]) -> Result<Vec<f64>> {
        self.symbol_names(symbols)?
            .iter()
            .map(|name| self.nominal(name))
            .collect()
    }

    pub fn set_nominals(&mut self, symbols: &[Sx], nominals: &[f64]) -> Result<()> {
        let names = self.symbol_names(symbols)?;
        check_values(&names, nominals)?;
        for (name, &nominal) in names.iter().zip(nominals) {
            self.set_nominal(name, nominal)?;
        }
        Ok(())
    }

    pub fn unit(&self, name: &str) -> Result<&str> {
        Ok(&self.lookup(name)?.unit)
    }

    pub fn set_unit(&mut self, name: &str, unit: impl Into<String>) -> Result<()> {
        self.lookup_mut(name)?.unit = unit.into();
        Ok(())
    }

    /// Common unit of a vector of variables, `"n/a"` for an empty vector.
    pub fn unit_of(&self, symbols: &[Sx]) -> Result<String> {
        let names = self.symbol_names(symbols)?;
        let Some((first, rest)) = names.split_first() else {
            return Ok("n/a".to_string());
        };
        let unit = self.unit(first)?;
        let mut units = vec![unit.to_string()];
        for name in rest {
            let other = self.unit(name)?;
            if !units.iter().any(|u| u == other) {
                units.push(other.to_string());
            }
        }
        if units.len() > 1 {
            return Err(OcpError::MixedUnits(units));
        }
        Ok(unit.to_string())
    }

    /// Names behind a vector of distinct, registered leaf symbols.
    pub fn symbol_names(&self, symbols: &[Sx]) -> Result<Vec<String>> {
        let mut seen = HashSet::with_capacity(symbols.len());
        symbols
            .iter()
            .map(|symbol| {
                if !symbol.is_symbolic() {
                    return Err(OcpError::DimensionMismatch(format!(
                        "{symbol} is not a leaf symbol"
                    )));
                }
                if !seen.insert(symbol.id()) {
                    return Err(OcpError::DimensionMismatch(format!(
                        "{symbol} appears more than once"
                    )));
                }
                Ok(self.lookup_symbol(symbol)?.name.clone())
            })
            .collect()
    }
}

fn check_values(names: &[String], values: &[f64]) -> Result<()> {
    if names.len() != values.len() {
        return Err(OcpError::DimensionMismatch(format!(
            "{} values for {} variables",
            values.len(),
            names.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T>, needle: &str) {
        match result {
            Ok(value) => panic!("expected error containing {needle:?}, got {value:?}"),
            Err(err) => assert!(
                err.to_string().contains(needle),
                "error {err} does not mention {needle:?}"
            ),
        }
    }

    fn registry_with(names: &[&str]) -> (VariableRegistry, Vec<Sx>) {
        let mut registry = VariableRegistry::new();
        let symbols = names
            .iter()
            .map(|name| registry.register(Variable::new(*name)).unwrap().v.clone())
            .collect();
        (registry, symbols)
    }

    #[test]
    fn register_rejects_duplicates() {
        let (mut registry, _) = registry_with(&["x"]);
        assert_eq!(
            registry.register(Variable::new("x")).map(|_| ()),
            Err(OcpError::DuplicateVariable("x".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn lookup_unknown_fails() {
        let (registry, _) = registry_with(&["x"]);
        assert_err_contains(registry.lookup("y"), "y");
        assert!(registry.lookup("x").is_ok());
    }

    #[test]
    fn normalized_attributes_scale_by_nominal() {
        let (mut registry, _) = registry_with(&["x"]);
        registry.set_nominal("x", 10.0).unwrap();
        registry.set_attribute("x", Attribute::Max, 2.0, true).unwrap();
        assert_eq!(registry.attribute("x", Attribute::Max, false).unwrap(), 20.0);
        assert_eq!(registry.attribute("x", Attribute::Max, true).unwrap(), 2.0);
    }

    #[test]
    fn vector_forms_require_distinct_leaf_symbols() {
        let (mut registry, symbols) = registry_with(&["x", "y"]);
        registry
            .set_attributes(&symbols, Attribute::Start, &[1.0, 2.0], false)
            .unwrap();
        assert_eq!(
            registry.attributes(&symbols, Attribute::Start, false).unwrap(),
            vec![1.0, 2.0]
        );
        let repeated = [symbols[0].clone(), symbols[0].clone()];
        assert_err_contains(registry.nominals(&repeated), "more than once");
        assert_err_contains(registry.nominals(&[&symbols[0] * 2.0]), "leaf symbol");
        assert_err_contains(
            registry.set_nominals(&symbols, &[1.0]),
            "1 values for 2 variables",
        );
        assert_err_contains(registry.nominals(&[Sx::sym("ghost")]), "ghost");
    }

    #[test]
    fn unit_of_reports_mixed_units() {
        let (mut registry, symbols) = registry_with(&["x", "y"]);
        assert_eq!(registry.unit_of(&[]).unwrap(), "n/a");
        registry.set_unit("x", "m").unwrap();
        registry.set_unit("y", "m").unwrap();
        assert_eq!(registry.unit_of(&symbols).unwrap(), "m");
        registry.set_unit("y", "s").unwrap();
        assert_eq!(
            registry.unit_of(&symbols),
            Err(OcpError::MixedUnits(vec!["m".into(), "s".into()]))
        );
    }
}
