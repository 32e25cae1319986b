//! Rate-limit monitoring engine behind the Token Meter menu-bar indicator.
//!
//! [`config::ConfigResolver`] supplies the key and interval,
//! [`scheduler::PollScheduler`] drives [`http::LimitClient`] on a timer,
//! folds each probe into a [`state::LimitState`] and publishes
//! [`scheduler::MeterUpdate`]s carrying the [`capacity::CapacityView`] a
//! presentation layer draws from.

pub mod capacity;
pub mod config;
pub mod console;
pub mod display;
pub mod http;
pub mod scheduler;
pub mod state;
pub mod types;
