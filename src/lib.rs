// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod dbglog;
pub mod debugfile;
pub mod demangle;
pub mod dwarf;
pub mod fileline;
pub mod minidebug;
pub mod objfile;
pub mod state;
pub mod symtab;

pub use state::{ErrorCallback, Frame, FrameVisitor, State, Symbol};

/// Type-erased error type.
///
/// We primarily use this to hand out errors from third-party libraries where
/// lifting them into distinct error variants didn't make sense because no
/// consumer cares about differentiating between different error variants.
pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

/// Virtual address in the address space of the traced process.
pub type VirtAddr = u64;
