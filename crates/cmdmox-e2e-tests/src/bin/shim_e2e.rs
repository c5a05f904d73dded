// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Launcher binary built inside this package so tests can locate it via
//! `CARGO_BIN_EXE_shim_e2e` without building the workspace first.

fn main() {
    std::process::exit(cmdmox_shim::run());
}
