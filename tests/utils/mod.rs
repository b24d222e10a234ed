// Each test binary only uses part of the shared helpers
#![allow(dead_code)]

pub mod factories;
pub mod fakes;
pub mod helpers;
