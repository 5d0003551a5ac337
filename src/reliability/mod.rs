pub mod audit_log;
pub mod circuit;
pub mod writer;
