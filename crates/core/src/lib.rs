#![deny(warnings)]

pub mod actuator;
pub mod config;
pub mod controller;
pub mod device;
pub mod driver;
pub mod emotion;
pub mod health;
pub mod perception;
pub mod selector;
pub mod sequencer;
pub mod util;
