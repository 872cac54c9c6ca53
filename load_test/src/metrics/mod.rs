pub mod reporter;
pub mod summary;
pub mod system;
