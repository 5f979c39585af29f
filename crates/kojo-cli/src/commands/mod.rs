pub mod daemon;
pub mod doctor;
pub mod sessions;
