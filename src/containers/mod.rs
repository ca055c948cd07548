//! Batches consumed by the losses.
//!
//! - [`Trajectories`]: full episodes `s_0 -> .. -> s_{n-1} -> s_f` (TB, SubTB, ZVar).
//! - [`Transitions`]: single edges, flattened from trajectories or built directly (DB).
//! - [`FlowStates`]: distinct non-initial states annotated with their incoming edges (FM).
//!
//! Constructors validate against the env so that the losses can assume well-formed input.

mod states;
mod trajectories;
mod transitions;

pub use states::{Edge, FlowState, FlowStates};
pub use trajectories::{Trajectories, Trajectory};
pub use transitions::{Transition, Transitions};
