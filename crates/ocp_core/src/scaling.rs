//! Nominal-value scaling of model variables and equations.

use tracing::{debug, trace};

use crate::error::{OcpError, Result};
use crate::model::FlatModel;
use crate::substitute::Substitution;
use crate::sx::Sx;
use crate::variable::Attribute;

/// Rewrites the model in terms of scaled variables `v / nominal`.
///
/// Bounds, start values and guesses are divided by the nominal, every
/// occurrence of `v` and `der(v)` becomes `v * nominal` and `der(v) * nominal`,
/// and the explicit right-hand sides (`ode`, `quad`, `idef`, `ydef`) are
/// divided by the nominal of the variable they define. Afterwards all
/// nominals are 1, so a second call does nothing.
pub fn rescale_variables(model: &mut FlatModel) -> Result<()> {
    let scaled: Vec<(String, f64)> = model
        .variables()
        .iter()
        .filter(|var| var.nominal != 1.0)
        .map(|var| (var.name.clone(), var.nominal))
        .collect();
    if scaled.is_empty() {
        trace!("all nominal values are 1");
        return Ok(());
    }
    if let Some((name, _)) = scaled.iter().find(|(_, nominal)| *nominal == 0.0) {
        return Err(OcpError::ZeroNominal(name.clone()));
    }
    debug!(variables = scaled.len(), "rescaling variables");

    let x_nominal = model.nominals(&model.x)?;
    let q_nominal = model.nominals(&model.q)?;
    let i_nominal = model.nominals(&model.i)?;
    let y_nominal = model.nominals(&model.y)?;

    let mut targets = Vec::with_capacity(2 * scaled.len());
    let mut replacements = Vec::with_capacity(2 * scaled.len());
    for (name, nominal) in &scaled {
        let var = model.variables_mut().lookup_mut(name)?;
        for attribute in Attribute::ALL {
            *var.attribute_mut(attribute) /= nominal;
        }
        targets.push(var.v.clone());
        replacements.push(&var.v * *nominal);
        targets.push(var.d.clone());
        replacements.push(&var.d * *nominal);
    }

    let mut substitution = Substitution::new(&targets, &replacements)?;
    let mut rescale = |exprs: &mut Vec<Sx>, divisors: Option<&[f64]>| {
        let mut out = substitution.apply_all(exprs);
        if let Some(divisors) = divisors {
            for (expr, &nominal) in out.iter_mut().zip(divisors) {
                *expr = &*expr / nominal;
            }
        }
        *exprs = out;
    };
    rescale(&mut model.ode, Some(x_nominal.as_slice()));
    rescale(&mut model.dae, None);
    rescale(&mut model.alg, None);
    rescale(&mut model.quad, Some(q_nominal.as_slice()));
    rescale(&mut model.idef, Some(i_nominal.as_slice()));
    rescale(&mut model.ydef, Some(y_nominal.as_slice()));
    rescale(&mut model.init, None);
    rescale(&mut model.mterm, None);
    rescale(&mut model.lterm, None);

    for (name, _) in &scaled {
        model.set_nominal(name, 1.0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::SxFunction;
    use crate::pipeline::eliminate_lagrange_terms;

    #[test]
    fn rescaling_divides_attributes_and_equations() {
        let mut model = FlatModel::new();
        let x = model.add_x("x").unwrap();
        let a = model.add_p("a").unwrap();
        model.add_ode(-(&a * &x));
        model.add_init(&x - 50.0);
        model.set_nominal("x", 100.0).unwrap();
        model.set_attribute("x", Attribute::Max, 300.0, false).unwrap();
        model.set_attribute("x", Attribute::Start, 50.0, false).unwrap();

        rescale_variables(&mut model).expect("nonzero nominals");

        assert_eq!(model.nominal("x").unwrap(), 1.0);
        assert_eq!(model.attribute("x", Attribute::Max, false).unwrap(), 3.0);
        assert_eq!(model.attribute("x", Attribute::Start, false).unwrap(), 0.5);
        let f = SxFunction::new(&[x, a], &[model.ode[0].clone(), model.init[0].clone()]).unwrap();
        let out = f.compile::<f64>().unwrap().eval(&[0.5, 2.0]).unwrap();
        // scaled state 0.5 is physical 50: ode = -2 * 50 / 100, init = 50 - 50
        assert!((out[0] + 1.0).abs() < 1e-12);
        assert!(out[1].abs() < 1e-12);
    }

    #[test]
    fn rescaling_twice_is_identity() {
        let mut model = FlatModel::new();
        let u = model.add_u("u").unwrap();
        model.tf = 10.0;
        model.add_lterm(&u * &u);
        eliminate_lagrange_terms(&mut model).unwrap();
        rescale_variables(&mut model).unwrap();

        let quad = model.quad.clone();
        let mterm = model.mterm.clone();
        rescale_variables(&mut model).unwrap();
        assert!(model.quad[0].is_equal(&quad[0]));
        assert!(model.mterm[0].is_equal(&mterm[0]));
        assert_eq!(model.mterm[0].to_string(), "(q_0*10)");
        assert_eq!(model.quad[0].to_string(), "((u*u)/10)");
    }

    #[test]
    fn zero_nominal_is_rejected_before_any_change() {
        let mut model = FlatModel::new();
        model.add_x("x").unwrap();
        model.add_ode(Sx::one());
        model.set_nominal("x", 0.0).unwrap();
        model.set_attribute("x", Attribute::Max, 4.0, false).unwrap();
        assert_eq!(
            rescale_variables(&mut model),
            Err(OcpError::ZeroNominal("x".into()))
        );
        assert_eq!(model.attribute("x", Attribute::Max, false).unwrap(), 4.0);
    }
}
