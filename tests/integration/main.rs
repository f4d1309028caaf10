//! Integration tests for Sumi-Harvest
//!
//! These tests use wiremock to create mock HTTP servers and drive whole
//! batches through the real HTTP fetcher.

mod harvest_tests;
mod resume_tests;
mod support;
