pub mod em;
pub mod stutter;
