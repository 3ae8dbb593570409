pub mod donation;
pub mod upload;
