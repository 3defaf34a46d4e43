pub mod blocks;
pub mod stats;
