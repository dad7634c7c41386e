//! Test module for worlty-core
//!
//! Covers the synchronous session core:
//! - Device tree merge, addressing, discovery and health diffing
//! - Command queue coalescing and debounce timing

mod fixtures;
