// src/lib.rs
pub mod cache;
pub mod config;
pub mod control;
pub mod health;
pub mod load_balancer;
pub mod metrics;
pub mod proxy;
pub mod routing;
pub mod rules;
pub mod server;
