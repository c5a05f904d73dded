// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Entry point for the universal launcher binary.

fn main() {
    std::process::exit(cmdmox_shim::run());
}
