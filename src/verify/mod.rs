pub mod invariants;
pub mod position_sm;
