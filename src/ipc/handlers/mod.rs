pub mod activities;
pub mod core;
pub mod exchange;
pub mod logs;
pub mod session;
pub mod stats;
pub mod students;
