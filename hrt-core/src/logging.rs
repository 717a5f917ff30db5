/*
 *   Copyright (c) 2025 R3BL LLC
 *   All rights reserved.
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

//! Opt-in `tracing` subscriber setup.
//!
//! `hrt-core` never installs a global subscriber on its own — libraries
//! shouldn't decide that for their embedders. [`init_from_env`] is a
//! convenience an embedder (or a test harness) can call to get sensible
//! defaults: `RUST_LOG`-driven filtering, falling back to `info`.

use tracing_subscriber::EnvFilter;

/// Installs a `tracing-subscriber` formatter driven by `RUST_LOG`, defaulting
/// to `info` when the variable is unset or unparsable. Returns `false`
/// (without panicking) if a global subscriber was already installed.
pub fn init_from_env() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).try_init().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_from_env_does_not_panic_when_called_twice() {
        let _ = init_from_env();
        let _ = init_from_env();
    }
}
