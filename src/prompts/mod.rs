//! Prompt module for LLM-based operations.
//!
//! This module provides modular prompt templates for various LLM tasks.

pub mod abstract_extract;

pub use abstract_extract::*;
