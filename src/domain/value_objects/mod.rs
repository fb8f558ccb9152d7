//! Value objects - Immutable objects defined by their attributes

mod dice;
mod ids;

pub use dice::{roll, DiceError, DiceRollResult, RollVisibility};
pub use ids::*;
