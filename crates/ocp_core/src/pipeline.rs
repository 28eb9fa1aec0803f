//! Structural transformations of a [`FlatModel`].
//!
//! Each transformation takes the model by exclusive reference and rewrites
//! its vectors in place. They compose in the documented order: the
//! block-solving steps run `eliminate_intermediates` themselves, and
//! `make_explicit` chains intermediate elimination, semi-explicit conversion
//! and algebraic elimination.
//!
//! Structural failures (non-square sparsity, a derivative entering its
//! block nonlinearly, cyclic definitions) abort with an error. The model is
//! left in an unspecified state in that case.

use nalgebra_sparse::pattern::SparsityPattern;
use tracing::{debug, info, trace};

use crate::blt::{block_triangularize, BltDecomposition};
use crate::error::{OcpError, Result};
use crate::function::SxFunction;
use crate::linsolve;
use crate::model::FlatModel;
use crate::substitute::{substitute_in_place, Substitution};
use crate::sx::{depends_on, Sx};
use crate::variable::{Causality, Variability, Variable};

/// Boolean pattern of d(equations)/d(unknowns).
pub fn dependency_sparsity(equations: &[Sx], unknowns: &[Sx]) -> Result<SparsityPattern> {
    SxFunction::new(unknowns, equations)?.jac_sparsity()
}

/// BLT ordering of `equations` against `unknowns`.
pub fn sort_blt(equations: &[Sx], unknowns: &[Sx]) -> Result<BltDecomposition> {
    let blt = block_triangularize(&dependency_sparsity(equations, unknowns)?)?;
    trace!(
        equations = equations.len(),
        blocks = blt.num_blocks(),
        "block triangular ordering"
    );
    Ok(blt)
}

/// Folds every Lagrange term into a new quadrature state `q_k` whose final
/// value is added to the Mayer terms.
pub fn eliminate_lagrange_terms(model: &mut FlatModel) -> Result<()> {
    if model.lterm.is_empty() {
        trace!("no Lagrange terms");
        return Ok(());
    }
    // Names are checked up front so a clash leaves the Lagrange terms intact.
    if let Some(name) = (0..model.lterm.len())
        .map(|k| format!("q_{k}"))
        .find(|name| model.variables().contains(name))
    {
        return Err(OcpError::DuplicateVariable(name));
    }
    debug!(lterm = model.lterm.len(), "eliminating Lagrange terms");
    let lterm = std::mem::take(&mut model.lterm);
    for (k, integrand) in lterm.into_iter().enumerate() {
        let mut var = Variable::new(format!("q_{k}"));
        var.variability = Variability::Continuous;
        var.causality = Causality::Internal;
        var.start = 0.0;
        if model.tf.is_finite() && model.tf != 0.0 {
            var.nominal = model.tf;
        }
        let q = model.register_variable(var)?;
        model.q.push(q.clone());
        model.quad.push(integrand);
        model.mterm.push(q);
    }
    Ok(())
}

/// Moves the quadrature states into the explicit states.
pub fn eliminate_quadratures(model: &mut FlatModel) -> Result<()> {
    check_pair("q", &model.q, "quad", &model.quad)?;
    debug!(q = model.q.len(), "eliminating quadratures");
    model.x.append(&mut model.q);
    model.ode.append(&mut model.quad);
    Ok(())
}

/// Orders `i`/`idef` so that every definition only uses earlier intermediates.
pub fn sort_intermediates(model: &mut FlatModel) -> Result<()> {
    if model.i.is_empty() {
        return Ok(());
    }
    check_pair("i", &model.i, "idef", &model.idef)?;
    let residual: Vec<Sx> = model
        .i
        .iter()
        .zip(&model.idef)
        .map(|(v, def)| v - def)
        .collect();
    let blt = sort_blt(&residual, &model.i)?;
    model.i = permute(&model.i, &blt.col_perm);
    model.idef = permute(&model.idef, &blt.col_perm);
    Ok(())
}

/// Sorts the intermediates and removes their mutual dependencies, keeping
/// `i`/`idef` in place.
pub fn split_intermediates(model: &mut FlatModel) -> Result<()> {
    if model.i.is_empty() {
        return Ok(());
    }
    sort_intermediates(model)?;
    let residual = substitute_in_place(&model.i, &mut model.idef, &mut [])?;
    if residual {
        return Err(OcpError::ResidualDependency("split_intermediates".into()));
    }
    Ok(())
}

/// Substitutes every intermediate by its definition in all equations, then
/// drops `i`/`idef`.
pub fn eliminate_intermediates(model: &mut FlatModel) -> Result<()> {
    if model.i.is_empty() {
        return Ok(());
    }
    sort_intermediates(model)?;
    debug!(i = model.i.len(), "eliminating intermediates");
    let residual = substitute_in_place(
        &model.i,
        &mut model.idef,
        &mut [
            &mut model.dae,
            &mut model.ode,
            &mut model.alg,
            &mut model.quad,
            &mut model.ydef,
            &mut model.init,
            &mut model.mterm,
            &mut model.lterm,
        ],
    )?;
    if residual {
        return Err(OcpError::ResidualDependency("eliminate_intermediates".into()));
    }
    model.i.clear();
    model.idef.clear();
    Ok(())
}

/// Moves the residuals of `dae` that contain no state derivative, and the
/// states whose derivative appears nowhere, to `alg`/`z`.
pub fn split_differential_algebraic(model: &mut FlatModel) -> Result<()> {
    eliminate_intermediates(model)?;
    if model.s.is_empty() {
        trace!("no implicit states to split");
        return Ok(());
    }
    check_pair("s", &model.s, "sdot", &model.sdot)?;
    check_pair("s", &model.s, "dae", &model.dae)?;

    let f = SxFunction::new(&model.sdot, &model.dae)?;
    let differential = f.sp_forward(&vec![true; f.n_in()])?;
    let used = f.sp_backward(&differential)?;

    let mut new_dae = Vec::new();
    let mut new_alg = Vec::new();
    for (eq, &is_differential) in model.dae.iter().zip(&differential) {
        if is_differential {
            new_dae.push(eq.clone());
        } else {
            new_alg.push(eq.clone());
        }
    }
    let mut new_s = Vec::new();
    let mut new_sdot = Vec::new();
    let mut new_z = Vec::new();
    for ((s, sdot), &is_used) in model.s.iter().zip(&model.sdot).zip(&used) {
        if is_used {
            new_s.push(s.clone());
            new_sdot.push(sdot.clone());
        } else {
            new_z.push(s.clone());
        }
    }
    if new_dae.len() != new_s.len() {
        return Err(OcpError::DimensionMismatch(format!(
            "{} differential equations for {} differential states",
            new_dae.len(),
            new_s.len()
        )));
    }

    debug!(
        differential = new_dae.len(),
        algebraic = new_alg.len(),
        "split implicit DAE"
    );
    model.dae = new_dae;
    model.s = new_s;
    model.sdot = new_sdot;
    model.alg.extend(new_alg);
    model.z.extend(new_z);
    Ok(())
}

/// BLT-sorts `dae` against `sdot`.
pub fn sort_differential(model: &mut FlatModel) -> Result<()> {
    if model.s.is_empty() {
        return Ok(());
    }
    check_pair("s", &model.s, "sdot", &model.sdot)?;
    let blt = sort_blt(&model.dae, &model.sdot)?;
    model.dae = permute(&model.dae, &blt.row_perm);
    model.s = permute(&model.s, &blt.col_perm);
    model.sdot = permute(&model.sdot, &blt.col_perm);
    Ok(())
}

/// BLT-sorts `alg` against `z`.
pub fn sort_algebraic(model: &mut FlatModel) -> Result<()> {
    if model.z.is_empty() {
        return Ok(());
    }
    let blt = sort_blt(&model.alg, &model.z)?;
    model.alg = permute(&model.alg, &blt.row_perm);
    model.z = permute(&model.z, &blt.col_perm);
    Ok(())
}

/// Solves the differential residuals for the state derivatives block by
/// block and moves the implicit states to `x`/`ode`.
pub fn make_semi_explicit(model: &mut FlatModel) -> Result<()> {
    eliminate_intermediates(model)?;
    split_differential_algebraic(model)?;
    if model.s.is_empty() {
        trace!("no implicit states");
        return Ok(());
    }

    let blt = sort_blt(&model.dae, &model.sdot)?;
    let dae = permute(&model.dae, &blt.row_perm);
    let s = permute(&model.s, &blt.col_perm);
    let sdot = permute(&model.sdot, &blt.col_perm);
    if !blt.is_structurally_nonsingular() {
        // states outside the square part have no matching derivative equation
        let [_, over_end, square_end, _] = blt.coarse_col_blocks;
        let mut stuck = names(&s[..over_end]);
        stuck.extend(names(&s[square_end..]));
        return Err(OcpError::UnsolvableBlock(stuck));
    }
    debug!(
        states = s.len(),
        blocks = blt.num_blocks(),
        "making DAE semi-explicit"
    );

    let mut new_ode = Vec::with_capacity(s.len());
    for b in 0..blt.num_blocks() {
        let rows = blt.block_rows(b);
        let cols = blt.block_cols(b);
        let unsolvable = || OcpError::UnsolvableBlock(names(&s[cols.clone()]));
        match solve_block(&dae[rows.clone()], &sdot[cols.clone()])? {
            BlockSolution::Explicit(solution) => new_ode.extend(solution),
            BlockSolution::Implicit => return Err(unsolvable()),
        }
    }

    // Earlier blocks' derivatives still appear in later solutions.
    let residual = substitute_in_place(&sdot, &mut new_ode, &mut [])?;
    if residual {
        return Err(OcpError::ResidualDependency("make_semi_explicit".into()));
    }

    model.x.extend(s);
    model.ode.extend(new_ode);
    model.dae.clear();
    model.s.clear();
    model.sdot.clear();
    Ok(())
}

/// Solves every algebraic block whose unknowns enter affinely, turning the
/// solved variables into intermediates that are then eliminated. Blocks that
/// cannot be solved stay in `z`/`alg`.
pub fn eliminate_algebraic(model: &mut FlatModel) -> Result<()> {
    eliminate_intermediates(model)?;
    if model.z.is_empty() {
        trace!("no algebraic variables");
        return Ok(());
    }
    check_pair("z", &model.z, "alg", &model.alg)?;

    let blt = sort_blt(&model.alg, &model.z)?;
    let alg = permute(&model.alg, &blt.row_perm);
    let z = permute(&model.z, &blt.col_perm);
    debug!(
        algebraic = z.len(),
        blocks = blt.num_blocks(),
        "eliminating algebraic variables"
    );

    let mut z_exp = Vec::new();
    let mut f_exp = Vec::new();
    let mut z_imp = Vec::new();
    let mut f_imp = Vec::new();
    for b in 0..blt.num_blocks() {
        let zb = &z[blt.block_cols(b)];
        let fb = &alg[blt.block_rows(b)];
        let solution = if blt.is_square_block(b) {
            solve_block(fb, zb)?
        } else {
            BlockSolution::Implicit
        };
        match solution {
            BlockSolution::Explicit(solution) => {
                z_exp.extend_from_slice(zb);
                f_exp.extend(solution);
            }
            BlockSolution::Implicit => {
                z_imp.extend_from_slice(zb);
                f_imp.extend_from_slice(fb);
            }
        }
    }

    let residual = substitute_in_place(&z_exp, &mut f_exp, &mut [])?;
    if residual {
        return Err(OcpError::ResidualDependency("eliminate_algebraic".into()));
    }
    if !z_imp.is_empty() {
        info!(implicit = ?names(&z_imp), "algebraic variables kept implicit");
    }

    // Solved variables go in front of any existing intermediates.
    z_exp.append(&mut model.i);
    f_exp.append(&mut model.idef);
    model.i = z_exp;
    model.idef = f_exp;
    model.z = z_imp;
    model.alg = f_imp;
    eliminate_intermediates(model)
}

/// Reduces the model to explicit ODE form.
pub fn make_explicit(model: &mut FlatModel) -> Result<()> {
    eliminate_intermediates(model)?;
    make_semi_explicit(model)?;
    eliminate_algebraic(model)?;
    if !model.z.is_empty() {
        return Err(OcpError::UnresolvedAlgebraicVariables(names(&model.z)));
    }
    Ok(())
}

enum BlockSolution {
    Explicit(Vec<Sx>),
    Implicit,
}

/// Solves the square system `residuals == 0` for `unknowns` when they enter
/// affinely: `residuals = J * unknowns + offset` with `J` free of the unknowns.
fn solve_block(residuals: &[Sx], unknowns: &[Sx]) -> Result<BlockSolution> {
    let jac = SxFunction::new(unknowns, residuals)?.jacobian()?;
    let entries: Vec<Sx> = jac.iter().cloned().collect();
    if depends_on(&entries, unknowns) {
        return Ok(BlockSolution::Implicit);
    }
    let zeros = vec![Sx::zero(); unknowns.len()];
    let offset = Substitution::new(unknowns, &zeros)?.apply_all(residuals);
    let rhs: Vec<Sx> = offset.iter().map(|r| -r).collect();
    match linsolve::solve(&jac, &rhs) {
        Ok(solution) => Ok(BlockSolution::Explicit(solution)),
        Err(OcpError::UnsolvableBlock(_)) => Ok(BlockSolution::Implicit),
        Err(err) => Err(err),
    }
}

fn permute(v: &[Sx], perm: &[usize]) -> Vec<Sx> {
    perm.iter().map(|&k| v[k].clone()).collect()
}

fn names(symbols: &[Sx]) -> Vec<String> {
    symbols.iter().map(|s| s.to_string()).collect()
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
