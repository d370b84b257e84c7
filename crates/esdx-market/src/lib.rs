//! Offer/contract state engine for the esdx bandwidth marketplace broker.

pub mod addr;
pub mod algebra;
pub mod cache;
pub mod model;
pub mod purchase;
pub mod service;
pub mod store;
pub mod wire;

pub use model::BW_PERIOD_SECS;
