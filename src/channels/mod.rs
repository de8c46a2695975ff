//! Inbound channels. The web gateway is the only channel today.

pub mod web;
