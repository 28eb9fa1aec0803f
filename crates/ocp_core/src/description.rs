//! Serde model description and its ingestion into a [`FlatModel`].
//!
//! Expressions are infix text (see [`crate::equation_engine::parse`]) with
//! identifiers naming registered variables, `der(name)` for derivatives and
//! `time` for the independent variable.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::equation_engine::parse_sx;
use crate::error::OcpError;
use crate::model::{EquationRole, FlatModel, VariableRole};
use crate::variable::{Alias, Category, Causality, Variability, Variable};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelDescription {
    pub variables: Vec<VariableDescription>,
    #[serde(default)]
    pub binding_equations: Vec<BindingEquation>,
    #[serde(default)]
    pub dynamic_equations: Vec<String>,
    #[serde(default)]
    pub initial_equations: Vec<String>,
    #[serde(default)]
    pub optimization: Option<Optimization>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDescription {
    pub name: String,
    #[serde(default)]
    pub value_reference: Option<i64>,
    #[serde(default)]
    pub variability: Variability,
    #[serde(default)]
    pub causality: Causality,
    #[serde(default)]
    pub alias: Alias,
    #[serde(default)]
    pub category: Option<Category>,
    #[serde(default)]
    pub real: Option<RealAttributes>,
}

/// Optional numeric attributes; absent fields keep the variable defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealAttributes {
    pub unit: Option<String>,
    pub display_unit: Option<String>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub initial_guess: Option<f64>,
    pub start: Option<f64>,
    pub nominal: Option<f64>,
    pub free: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingEquation {
    pub variable: String,
    pub expression: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSpec {
    pub value: Option<f64>,
    pub free: Option<bool>,
    pub initial_guess: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimePoint {
    pub index: usize,
    pub value: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Optimization {
    #[serde(default)]
    pub interval_start_time: TimeSpec,
    #[serde(default)]
    pub interval_final_time: TimeSpec,
    #[serde(default)]
    pub time_points: Vec<TimePoint>,
    /// Mayer terms.
    #[serde(default)]
    pub objective: Vec<String>,
    /// Lagrange integrands.
    #[serde(default)]
    pub integrand: Vec<String>,
    #[serde(default)]
    pub point_constraints: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub path_constraints: Vec<String>,
}

/// Builds a flat model from a description.
pub fn build_model(description: &ModelDescription) -> Result<FlatModel> {
    let mut model = FlatModel::new();

    for desc in &description.variables {
        if matches!(desc.alias, Alias::Alias | Alias::NegatedAlias) {
            debug!(variable = %desc.name, "skipping alias");
            continue;
        }
        if model.variables().contains(&desc.name) {
            continue;
        }
        let var = variable_from(desc);
        let (category, causality, free) = (var.category, var.causality, var.free);
        let symbol = model
            .register_variable(var)
            .with_context(|| format!("registering variable {}", desc.name))?;

        let role = match category {
            None => {
                warn!(variable = %desc.name, "variable has no category; left unclassified");
                None
            }
            Some(Category::Derivative) => None,
            Some(Category::State) => Some(VariableRole::S),
            Some(Category::DependentConstant) => None,
            Some(Category::IndependentConstant) => None,
            Some(Category::DependentParameter) => None,
            Some(Category::IndependentParameter) => free.then_some(VariableRole::P),
            Some(Category::Algebraic) => match causality {
                Causality::Internal => Some(VariableRole::S),
                Causality::Input => Some(VariableRole::U),
                Causality::Output => None,
            },
        };
        if let Some(role) = role {
            model.append_variable(role, &symbol)?;
        }
    }

    for eq in &description.binding_equations {
        let symbol = model
            .symbol(&eq.variable)
            .with_context(|| format!("binding equation for {}", eq.variable))?;
        let expr = parse_sx(&eq.expression, &model)
            .with_context(|| format!("binding equation for {}", eq.variable))?;
        model.append_variable(VariableRole::I, &symbol)?;
        model.append_equation(EquationRole::Idef, expr);
    }
    for text in &description.dynamic_equations {
        let expr = parse_sx(text, &model).context("dynamic equation")?;
        model.append_equation(EquationRole::Dae, expr);
    }
    for text in &description.initial_equations {
        let expr = parse_sx(text, &model).context("initial equation")?;
        model.append_equation(EquationRole::Init, expr);
    }

    if let Some(opt) = &description.optimization {
        apply_optimization(&mut model, opt)?;
    }

    if model.s.len() != model.dae.len() {
        warn!(
            states = model.s.len(),
            equations = model.dae.len(),
            "number of differential-algebraic equations does not match the number of implicitly defined states"
        );
    }
    if model.z.len() != model.alg.len() {
        warn!(
            variables = model.z.len(),
            equations = model.alg.len(),
            "number of algebraic equations does not match the number of algebraic variables"
        );
    }
    debug!(
        variables = model.variables().len(),
        s = model.s.len(),
        i = model.i.len(),
        "model ingested"
    );
    Ok(model)
}

fn variable_from(desc: &VariableDescription) -> Variable {
    let mut var = Variable::new(desc.name.as_str());
    var.value_reference = desc.value_reference;
    var.variability = desc.variability;
    var.causality = desc.causality;
    var.alias = desc.alias;
    var.category = desc.category;
    if let Some(real) = &desc.real {
        if let Some(unit) = &real.unit {
            var.unit = unit.clone();
        }
        if let Some(display_unit) = &real.display_unit {
            var.display_unit = display_unit.clone();
        }
        var.min = real.min.unwrap_or(var.min);
        var.max = real.max.unwrap_or(var.max);
        var.initial_guess = real.initial_guess.unwrap_or(var.initial_guess);
        var.start = real.start.unwrap_or(var.start);
        var.nominal = real.nominal.unwrap_or(var.nominal);
        var.free = real.free.unwrap_or(var.free);
    }
    var
}

fn apply_optimization(model: &mut FlatModel, opt: &Optimization) -> Result<()> {
    let start = &opt.interval_start_time;
    model.t0 = start.value.unwrap_or(model.t0);
    model.t0_free = start.free.unwrap_or(model.t0_free);
    model.t0_guess = start.initial_guess.unwrap_or(model.t0_guess);
    let end = &opt.interval_final_time;
    model.tf = end.value.unwrap_or(model.tf);
    model.tf_free = end.free.unwrap_or(model.tf_free);
    model.tf_guess = end.initial_guess.unwrap_or(model.tf_guess);

    let mut points: Vec<&TimePoint> = opt.time_points.iter().collect();
    points.sort_by_key(|point| point.index);
    for pair in points.windows(2) {
        if pair[0].index == pair[1].index {
            bail!("time point index {} appears more than once", pair[0].index);
        }
    }
    model.tp = points.iter().map(|point| point.value).collect();

    for text in &opt.objective {
        let expr = parse_sx(text, &*model).context("objective function")?;
        model.append_equation(EquationRole::Mterm, expr);
    }
    for text in &opt.integrand {
        let expr = parse_sx(text, &*model).context("integrand objective function")?;
        model.append_equation(EquationRole::Lterm, expr);
    }

    for (section, items) in [
        ("point constraints", &opt.point_constraints),
        ("constraints", &opt.constraints),
        ("path constraints", &opt.path_constraints),
    ] {
        if !items.is_empty() {
            let err = OcpError::UnsupportedConstruct(section.to_string());
            warn!(count = items.len(), "{err}, ignored");
        }
    }
    Ok(())
}
