pub mod blocking;
pub mod manager;
pub mod normalize;
pub mod resolver;
pub mod similarity;
