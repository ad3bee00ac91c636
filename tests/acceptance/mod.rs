//! Integration tests for fine-delay acceptance testing.

mod calibration_test;
mod capture_test;
mod common;
mod config_test;
