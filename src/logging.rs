// Copyright 2020 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use env_logger::{Builder, Env, Target};

/// Sends log messages to stdout, leaving stderr to the timing records and
/// fatal errors.  The level defaults to info and can be changed with
/// RUST_LOG.
pub fn init() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stdout)
        .init();
}
