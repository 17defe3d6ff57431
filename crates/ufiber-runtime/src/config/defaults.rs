//! Compile-time defaults
//!
//! Generated by `build.rs` from the library defaults merged with the file
//! named by `UFIBER_CONFIG_RS`, if any.

include!(concat!(env!("OUT_DIR"), "/ufiber_merged_config.rs"));
