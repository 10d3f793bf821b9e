//! The leapfrog integrator.
//!
//! Trajectories grow in both directions from the initial point. A backward
//! step is a forward step with negated step size, so the momentum of every
//! state points along increasing trajectory index.

use rand::{distr::StandardUniform, prelude::Distribution};

use crate::{mass_matrix::MassMatrix, model::CpuLogpFunc, state::State};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub(crate) fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

impl Distribution<Direction> for StandardUniform {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Direction {
        if rng.random::<bool>() {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// One leapfrog step of size `epsilon` from `start`, written into `out`.
///
/// Half step of the momentum with the gradient at the start, full step of
/// the position along `M⁻¹ p`, then the second half step of the momentum
/// with the gradient at the new position. Velocity and kinetic energy of
/// `out` are updated for the final momentum.
///
/// `out` must not be shared with any other state.
pub(crate) fn leapfrog<F, M>(
    logp: &mut F,
    mass_matrix: &M,
    start: &State,
    out: &mut State,
    epsilon: f64,
) -> Result<(), F::LogpError>
where
    F: CpuLogpFunc,
    M: MassMatrix,
{
    start.first_momentum_halfstep(out, epsilon);
    mass_matrix.update_velocity(out.try_mut_inner().expect("State already in use"));

    start.position_step(out, epsilon);
    {
        let inner = out.try_mut_inner().expect("State already in use");
        let value = logp.logp(&inner.q, &mut inner.grad)?;
        inner.potential_energy = -value;
    }

    out.second_momentum_halfstep(epsilon);
    let inner = out.try_mut_inner().expect("State already in use");
    mass_matrix.update_velocity(inner);
    mass_matrix.update_kinetic_energy(inner);
    Ok(())
}
