//! Context management: token estimation and budget-driven shrinking of the
//! working conversation before each model call.

pub mod shrinker;
pub mod token;

pub use shrinker::BudgetShrinker;
