//! The reconciliation engine: scoring, candidate generation, decision
//! logic, match state transitions and the evaluation orchestrator.

pub mod candidates;
pub mod decision;
pub mod orchestrator;
pub mod regression;
pub mod scorers;
pub mod state;
