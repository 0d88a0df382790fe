#![doc = include_str!("../README.md")]

pub mod cache;
pub mod collab;
pub mod config;
pub mod engine;
pub mod handler;
pub mod rpc;
pub mod server;
pub mod telemetry;
