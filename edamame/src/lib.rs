pub mod artifact;
pub mod common;
pub mod config;
pub mod dataset;
pub mod error;
pub mod model;
pub mod normalization;
pub mod predict;
pub mod preprocess;
pub mod train;
