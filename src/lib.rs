//! monitornap - dims idle monitors per display.
//!
//! Pointer and foreground-window activity is sampled from the compositor;
//! each monitor runs its own idle state machine and is dimmed through DDC/CI
//! brightness and an optional software overlay.

pub mod backend;
pub mod config;
pub mod control;
pub mod controller;
pub mod dimmer;
pub mod domain;
pub mod monitor;
pub mod sampler;
pub mod throttle;
