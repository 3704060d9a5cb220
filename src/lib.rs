//! iLy server: an AI website builder backend.
//!
//! Visitors describe a site, a hosted LLM streams back one HTML document, and
//! the result can be deployed to a static space or remixed from one. Signed-in
//! users are metered per tier and can buy more through a checkout webhook.
//!
//! Vendor integrations sit behind the traits in [`auth`], [`inference`],
//! [`database`], [`billing`] and [`hosting`]; [`state::AppState`] wires the
//! production clients and [`rest::create_router`] exposes them over HTTP.

pub mod auth;
pub mod billing;
pub mod config;
pub mod database;
pub mod error;
pub mod feedback;
pub mod hosting;
pub mod inference;
pub mod models;
pub mod preview;
pub mod providers;
pub mod rate_limit;
pub mod rest;
pub mod state;
pub mod telemetry;

#[cfg(test)]
mod testing;
