// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Captures every free page, then releases the pages in random order.

use std::process::exit;

use frame_probe::kernel::{Paths, ProcKernel};
use frame_probe::{logging, randomizer, Result};

fn run() -> Result<usize> {
    let mut kernel = ProcKernel::new(Paths::system())?;
    randomizer::run(&mut kernel, &mut randomizer::time_seeded_rng())
}

fn main() {
    logging::init();

    if let Err(e) = run() {
        eprintln!("frame-randomizer: {}", e);
        exit(e.exit_code());
    }
}
