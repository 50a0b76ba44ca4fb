pub mod common;
pub mod manager_tests;
pub mod manifest_tests;
