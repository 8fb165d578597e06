// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Captures every free page and times a serialized direct write to each of
//! them.  One line per page goes to stderr: the page address followed by the
//! cycle count of every round.

use std::io;
use std::process::exit;

use frame_probe::cycles::NativeClock;
use frame_probe::kernel::{Paths, ProcKernel};
use frame_probe::timer::{self, TIME_ROUNDS};
use frame_probe::{logging, Result};

fn run() -> Result<usize> {
    let mut kernel = ProcKernel::new(Paths::system())?;
    let mut clock = NativeClock::default();
    let stderr = io::stderr();
    let mut out = stderr.lock();
    timer::run(&mut kernel, &mut clock, &mut out, TIME_ROUNDS)
}

fn main() {
    logging::init();

    if let Err(e) = run() {
        eprintln!("frame-timer: {}", e);
        exit(e.exit_code());
    }
}
