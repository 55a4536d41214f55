pub mod audit;
pub mod core;
pub mod grades;
pub mod permissions;
pub mod retakes;
pub mod roster;
pub mod setup;
