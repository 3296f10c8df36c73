//! Aegis Backend Library
//!
//! Real-time risk & fraud decision engine: event ingress with a
//! transactional outbox, a rule-driven scoring engine, tamper-evident audit
//! chains, link analysis, shadow-mode measurement, and signed outbound
//! delivery. Exposed as a library for the `aegis` binary and the
//! integration tests.

pub mod api;
pub mod audit;
pub mod auth;
pub mod bus;
pub mod decisions;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod graph;
pub mod middleware;
pub mod models;
pub mod outbox;
pub mod shadow;
pub mod state;
pub mod worker;

pub use models::{Config, Event, RecommendedAction, RiskAssessment, RiskLevel};
