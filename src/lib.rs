pub mod batch;
pub mod calendar;
pub mod config;
pub mod domain;
pub mod error;
pub mod forcing;
pub mod fs_util;
pub mod grid;
pub mod locator;
pub mod metadata;
pub mod netcdf;
pub mod output;
pub mod package;
pub mod pipeline;
pub mod process;
pub mod recipe;
pub mod store;
pub mod subset;
pub mod tools;
