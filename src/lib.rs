pub mod clustering;
pub mod consolidation;
pub mod matching;
pub mod models;
pub mod pipeline;
pub mod rules;
pub mod utils;
