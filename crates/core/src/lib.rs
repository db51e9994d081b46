//! Sentinel: an autonomous SRE log-triage and investigation agent.
//!
//! Logs come in through [`ingress`], get classified by [`triage`], and
//! anything alert-worthy is admitted, deduplicated and scheduled by
//! [`scheduler`], which dispatches a bounded ReAct loop in
//! [`investigation`] and records the outcome via [`reports`] and
//! [`alerting`]. [`agent_manager`] wires all of it together.

pub mod agent_manager;
pub mod alerting;
pub mod cache;
pub mod config;
pub mod ingress;
pub mod investigation;
pub mod metrics;
pub mod model;
pub mod reports;
pub mod sanitize;
pub mod scheduler;
pub mod supervisor;
pub mod tools;
pub mod triage;
pub mod types;
