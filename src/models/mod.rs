// src/models/mod.rs
pub mod consolidation;
pub mod core;
pub mod matching;
pub mod stats_models;
