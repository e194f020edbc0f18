pub mod hit;
pub mod twobit;
