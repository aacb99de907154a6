#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod capacity;
pub mod cli;
pub mod config;
pub mod console;
pub mod domain_xml;
pub mod error;
pub mod host;
pub mod install;
pub mod logging;
pub mod paths;
pub mod plan;
pub mod progress;
pub mod provision;
