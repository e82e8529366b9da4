//! Fuzz test for configuration file parsing
//!
//! Tests that arbitrary TOML input doesn't cause panics when parsed and
//! validated as skiff configuration.

#![no_main]

use libfuzzer_sys::fuzz_target;
use skiff_core::Config;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = Config::from_toml_str(s) {
            let _ = config.validate();
        }
    }
});
