// src/lib.rs
//! Sponsorship relay and status tracking for ERC-4337 v0.7 UserOperations.

pub mod bundler;
pub mod chain;
pub mod checker;
pub mod config;
pub mod contracts;
pub mod error;
pub mod observer;
pub mod paymaster;
pub mod poller;
pub mod revert;
pub mod rpc;
pub mod serializer;
pub mod sponsorship;
pub mod tracker;
pub mod types;
pub mod units;
