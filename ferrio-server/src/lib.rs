//! Ferrio Server - registry, name and data services over the shared wire
//! protocol.

pub mod config;
pub mod service;
