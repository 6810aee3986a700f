pub mod file;
pub mod paths;
