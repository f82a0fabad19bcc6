// SPDX-License-Identifier: MIT

// Generated by build.rs, one test per tests/data/*.hid.bin
include!(concat!(env!("OUT_DIR"), "/test-report-descriptors.rs"));
