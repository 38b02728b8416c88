//! Scenario-based tests for stepline

mod helpers;

mod background_drain;
mod deploy_phase;
mod failure_handling;
mod fact_ledger;
mod platform_conditions;
