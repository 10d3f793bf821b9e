//! Points in phase space, allocated from a per-chain pool.
//!
//! A trajectory of depth 10 touches a few thousand states, so the buffers
//! are recycled instead of reallocated. States are reference counted but not
//! `Send`: every chain owns its own pool.

use std::{
    cell::RefCell,
    ops::Deref,
    rc::{Rc, Weak},
};

use crate::math::{axpy, axpy_out, scalar_prods2, scalar_prods3};

struct StateStorage {
    free_states: RefCell<Vec<Rc<InnerState>>>,
}

impl StateStorage {
    fn with_capacity(capacity: usize) -> StateStorage {
        StateStorage {
            free_states: RefCell::new(Vec::with_capacity(capacity)),
        }
    }
}

impl ReuseState for StateStorage {
    fn reuse_state(&self, state: Rc<InnerState>) {
        self.free_states.borrow_mut().push(state)
    }
}

pub(crate) struct StatePool {
    storage: Rc<StateStorage>,
    dim: usize,
}

impl StatePool {
    pub(crate) fn new(dim: usize, capacity: usize) -> StatePool {
        StatePool {
            storage: Rc::new(StateStorage::with_capacity(capacity)),
            dim,
        }
    }

    pub(crate) fn new_state(&mut self) -> State {
        let inner = match self.storage.free_states.borrow_mut().pop() {
            Some(inner) => {
                assert!(self.dim == inner.q.len(), "dim mismatch in state pool");
                inner
            }
            None => {
                let owner: Rc<dyn ReuseState> = self.storage.clone();
                Rc::new(InnerState::new(self.dim, &owner))
            }
        };
        State {
            inner: std::mem::ManuallyDrop::new(inner),
        }
    }

    /// A fresh state holding the same values as `other`.
    pub(crate) fn copy_state(&mut self, other: &State) -> State {
        let mut state = self.new_state();
        let inner = state.try_mut_inner().expect("New state should have only one reference");
        inner.p.copy_from_slice(&other.p);
        inner.q.copy_from_slice(&other.q);
        inner.v.copy_from_slice(&other.v);
        inner.p_sum.copy_from_slice(&other.p_sum);
        inner.grad.copy_from_slice(&other.grad);
        inner.idx_in_trajectory = other.idx_in_trajectory;
        inner.kinetic_energy = other.kinetic_energy;
        inner.potential_energy = other.potential_energy;
        state
    }
}

trait ReuseState {
    fn reuse_state(&self, state: Rc<InnerState>);
}

pub(crate) struct InnerState {
    /// Momentum
    pub(crate) p: Box<[f64]>,
    /// Position
    pub(crate) q: Box<[f64]>,
    /// Velocity, `M⁻¹ p`
    pub(crate) v: Box<[f64]>,
    /// Sum of momenta from the start of the trajectory to this point
    pub(crate) p_sum: Box<[f64]>,
    /// Gradient of the log density at `q`
    pub(crate) grad: Box<[f64]>,
    pub(crate) idx_in_trajectory: i64,
    pub(crate) kinetic_energy: f64,
    pub(crate) potential_energy: f64,
    reuser: Weak<dyn ReuseState>,
}

impl InnerState {
    fn new(size: usize, owner: &Rc<dyn ReuseState>) -> InnerState {
        InnerState {
            p: vec![0.; size].into(),
            q: vec![0.; size].into(),
            v: vec![0.; size].into(),
            p_sum: vec![0.; size].into(),
            grad: vec![0.; size].into(),
            idx_in_trajectory: 0,
            kinetic_energy: 0.,
            potential_energy: 0.,
            reuser: Rc::downgrade(owner),
        }
    }
}

pub(crate) struct State {
    inner: std::mem::ManuallyDrop<Rc<InnerState>>,
}

impl Deref for State {
    type Target = InnerState;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

#[derive(Debug)]
pub(crate) struct StateInUse {}

type Result<T> = std::result::Result<T, StateInUse>;

impl State {
    pub(crate) fn try_mut_inner(&mut self) -> Result<&mut InnerState> {
        match Rc::get_mut(&mut self.inner) {
            Some(val) => Ok(val),
            None => Err(StateInUse {}),
        }
    }

    /// The no-U-turn criterion between two points of the same trajectory.
    ///
    /// The momentum sums are arranged so that the sum over the whole
    /// span between the two points is recovered whichever side of the
    /// initial point they are on.
    pub(crate) fn is_turning(&self, other: &Self) -> bool {
        let (start, end) = if self.idx_in_trajectory < other.idx_in_trajectory {
            (self, other)
        } else {
            (other, self)
        };

        let a = start.idx_in_trajectory;
        let b = end.idx_in_trajectory;

        assert!(a < b);
        let (turn1, turn2) = if (a >= 0) & (b >= 0) {
            scalar_prods3(&end.p_sum, &start.p_sum, &start.p, &end.v, &start.v)
        } else if (b >= 0) & (a < 0) {
            scalar_prods2(&end.p_sum, &start.p_sum, &end.v, &start.v)
        } else {
            assert!((a < 0) & (b < 0));
            scalar_prods3(&start.p_sum, &end.p_sum, &end.p, &end.v, &start.v)
        };

        (turn1 < 0.) | (turn2 < 0.)
    }

    pub(crate) fn energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    pub(crate) fn potential_energy(&self) -> f64 {
        self.potential_energy
    }

    pub(crate) fn index_in_trajectory(&self) -> i64 {
        self.idx_in_trajectory
    }

    pub(crate) fn log_acceptance_probability(&self, initial_energy: f64) -> f64 {
        (initial_energy - self.energy()).min(0.)
    }

    /// Mark this state as the start of a new trajectory.
    pub(crate) fn make_init_point(&mut self) {
        let inner = self.try_mut_inner().expect("State already in use");
        inner.idx_in_trajectory = 0;
        inner.p_sum.copy_from_slice(&inner.p);
    }

    pub(crate) fn first_momentum_halfstep(&self, out: &mut Self, epsilon: f64) {
        axpy_out(
            &self.grad,
            &self.p,
            epsilon / 2.,
            &mut out.try_mut_inner().expect("State already in use").p,
        );
    }

    pub(crate) fn position_step(&self, out: &mut Self, epsilon: f64) {
        let out = out.try_mut_inner().expect("State already in use");
        axpy_out(&out.v, &self.q, epsilon, &mut out.q);
    }

    pub(crate) fn second_momentum_halfstep(&mut self, epsilon: f64) {
        let inner = self.try_mut_inner().expect("State already in use");
        axpy(&inner.grad, &mut inner.p, epsilon / 2.);
    }

    /// Update the momentum sum of `target`, the successor of `self` in the trajectory.
    pub(crate) fn set_psum(&self, target: &mut Self) {
        let out = target.try_mut_inner().expect("State already in use");

        assert!(out.idx_in_trajectory != 0);

        if out.idx_in_trajectory == -1 {
            out.p_sum.copy_from_slice(&out.p);
        } else {
            axpy_out(&out.p, &self.p_sum, 1., &mut out.p_sum);
        }
    }

    pub(crate) fn index_in_trajectory_mut(&mut self) -> &mut i64 {
        &mut self
            .try_mut_inner()
            .expect("State already in use")
            .idx_in_trajectory
    }
}

impl Drop for State {
    fn drop(&mut self) {
        let mut rc = unsafe { std::mem::ManuallyDrop::take(&mut self.inner) };
        if let Some(state_ref) = Rc::get_mut(&mut rc) {
            if let Some(reuser) = &mut state_ref.reuser.upgrade() {
                reuser.reuse_state(rc);
            }
        }
    }
}

impl Clone for State {
    fn clone(&self) -> Self {
        State {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn crate_pool() {
        let mut pool = StatePool::new(10, 20);
        let mut state = pool.new_state();
        assert!(state.p.len() == 10);
        state.try_mut_inner().unwrap();

        let mut state2 = state.clone();
        assert!(state.try_mut_inner().is_err());
        assert!(state2.try_mut_inner().is_err());
    }

    #[test]
    fn dropped_states_are_reused() {
        let mut pool = StatePool::new(3, 4);
        let mut state = pool.new_state();
        state.try_mut_inner().unwrap().q[0] = 7.;
        drop(state);
        assert_eq!(pool.storage.free_states.borrow().len(), 1);
        let state = pool.new_state();
        assert_eq!(pool.storage.free_states.borrow().len(), 0);
        assert_eq!(state.q.len(), 3);
    }

    #[test]
    fn copy_is_independent() {
        let mut pool = StatePool::new(2, 4);
        let mut a = pool.new_state();
        {
            let inner = a.try_mut_inner().unwrap();
            inner.q.copy_from_slice(&[1., 2.]);
            inner.potential_energy = 3.;
            inner.kinetic_energy = 0.5;
        }
        let mut b = pool.copy_state(&a);
        assert_eq!(&b.q[..], &[1., 2.]);
        assert_eq!(b.energy(), 3.5);
        b.try_mut_inner().unwrap().q[0] = 5.;
        assert_eq!(a.q[0], 1.);
    }

    #[test]
    fn straight_line_is_not_turning() {
        let mut pool = StatePool::new(2, 4);
        let mut start = pool.new_state();
        {
            let inner = start.try_mut_inner().unwrap();
            inner.p.copy_from_slice(&[1., 0.]);
            inner.v.copy_from_slice(&[1., 0.]);
        }
        start.make_init_point();

        let mut next = pool.copy_state(&start);
        *next.index_in_trajectory_mut() = 1;
        start.set_psum(&mut next);
        assert_eq!(&next.p_sum[..], &[2., 0.]);
        assert!(!start.is_turning(&next));

        let mut back = pool.copy_state(&next);
        {
            let inner = back.try_mut_inner().unwrap();
            inner.p.copy_from_slice(&[-1., 0.]);
            inner.v.copy_from_slice(&[-1., 0.]);
            inner.idx_in_trajectory = 2;
        }
        next.set_psum(&mut back);
        assert!(start.is_turning(&back));
    }
}
