pub mod attendance;
pub mod backup;
pub mod core;
pub mod exams;
pub mod fees;
pub mod marks;
pub mod payments;
pub mod setup;
