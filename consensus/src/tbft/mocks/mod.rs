//! Collection of mocks used to test `tbft`.

pub mod access;
pub mod application;
pub mod faults;
pub mod reporter;
pub mod store;
pub mod supervisor;
