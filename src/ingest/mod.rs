//! Ingestion-layer defense: nothing reaches the detectors or the gate
//! without passing the candle validator.

pub mod validator;

pub use validator::{CandleValidator, RejectKind, Rejection, ValidatorConfig, ValidatorStatus, Verdict};
