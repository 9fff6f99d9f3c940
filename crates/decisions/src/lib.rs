//! Decision engine: signal aggregation, yield scoring, goal-based risk gating
//! and the approval state machine for trading decisions.
//!
//! Prices come from a [`price::PriceProvider`]; approved decisions are handed
//! to an [`executor::OrderExecutor`] (paper fills by default).

pub mod engine;
pub mod error;
pub mod executor;
pub mod price;
pub mod scoring;
pub mod types;

pub use {
    engine::DecisionEngine,
    error::{DecisionError, Result},
    executor::{ExecutionReport, OrderExecutor, OrderRequest, PaperExecutor},
    price::{PriceProvider, StaticPriceProvider},
    types::{
        ApprovedBy, Decision, DecisionAction, DecisionStatus, Direction, MarketOpportunity,
        OpportunityKind, RiskTolerance, Signal, TradeAction, UserGoal,
    },
};
