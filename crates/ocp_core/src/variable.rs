//! Per-variable metadata and its attribute accessors.

use serde::{Deserialize, Serialize};

use crate::sx::Sx;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Variability {
    Constant,
    Parameter,
    Discrete,
    #[default]
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Causality {
    Input,
    Output,
    #[default]
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Alias {
    #[default]
    NoAlias,
    Alias,
    NegatedAlias,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    Derivative,
    State,
    DependentConstant,
    IndependentConstant,
    DependentParameter,
    IndependentParameter,
    Algebraic,
}

/// Selects one of the numeric per-variable attributes that scale with the
/// nominal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Attribute {
    Min,
    Max,
    Start,
    DerivativeStart,
    InitialGuess,
}

impl Attribute {
    pub const ALL: [Attribute; 5] = [
        Attribute::Min,
        Attribute::Max,
        Attribute::Start,
        Attribute::DerivativeStart,
        Attribute::InitialGuess,
    ];
}

/// A named model variable. The value symbol `v` and derivative symbol `d`
/// are created together and never replaced.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub v: Sx,
    pub d: Sx,
    pub value_reference: Option<i64>,
    pub variability: Variability,
    pub causality: Causality,
    pub alias: Alias,
    pub category: Option<Category>,
    pub unit: String,
    pub display_unit: String,
    pub min: f64,
    pub max: f64,
    pub start: f64,
    pub derivative_start: f64,
    pub initial_guess: f64,
    pub nominal: f64,
    pub free: bool,
}

impl Variable {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            v: Sx::sym(name.clone()),
            d: Sx::sym(format!("der({name})")),
            name,
            value_reference: None,
            variability: Variability::default(),
            causality: Causality::default(),
            alias: Alias::default(),
            category: None,
            unit: String::new(),
            display_unit: String::new(),
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            start: 0.0,
            derivative_start: 0.0,
            initial_guess: 0.0,
            nominal: 1.0,
            free: false,
        }
    }

    pub fn attribute(&self, attribute: Attribute) -> f64 {
        match attribute {
            Attribute::Min => self.min,
            Attribute::Max => self.max,
            Attribute::Start => self.start,
            Attribute::DerivativeStart => self.derivative_start,
            Attribute::InitialGuess => self.initial_guess,
        }
    }

    pub fn attribute_mut(&mut self, attribute: Attribute) -> &mut f64 {
        match attribute {
            Attribute::Min => &mut self.min,
            Attribute::Max => &mut self.max,
            Attribute::Start => &mut self.start,
            Attribute::DerivativeStart => &mut self.derivative_start,
            Attribute::InitialGuess => &mut self.initial_guess,
        }
    }
}
