// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Locates separate debug-info files for a loaded module.
//!
//! Shipped binaries rarely carry their own DWARF data. This module implements
//! the probing conventions used to find the split-off counterpart:
//!
//! - GNU build IDs under `/usr/lib/debug/.build-id/XX/REST.debug`,
//! - `.gnu_debuglink` siblings (CRC-32 gated),
//! - `.gnu_debugaltlink` supplementary files,
//! - macOS `.dSYM` sibling bundles (UUID gated).
//!
//! All probes are non-fatal: a candidate that does not exist, does not parse
//! or fails its consistency gate is skipped and the next fallback is tried.

use crate::debug;
use crate::objfile::{File, GnuDebugAltLink, GnuDebugLink, Reader};
use crate::state::Report;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Directory searched for debug files keyed by GNU build ID.
///
/// The GDB manual says that this is the only place gdb looks for a debug
/// file when the build ID is known.
const BUILD_ID_DIR: &str = "/usr/lib/debug/.build-id";

/// Directory prefix for system-wide debuglink copies.
const DEBUG_DIR: &str = "/usr/lib/debug";

/// Subdirectory of the module's directory probed for debuglink files.
const DEBUG_SUBDIR: &str = ".debug";

/// Upper bound on symlink-chain resolution steps.
const MAX_SYMLINK_DEPTH: usize = 32;

/// A successfully opened debug-file candidate.
pub struct DebugFile {
    /// Path the candidate was found under.
    pub path: PathBuf,

    /// The opened image.
    pub file: Arc<File>,
}

/// Constructs the build-id probe path: first byte as a hex directory, rest of
/// the ID as the hex file stem.
pub fn build_id_path(build_id: &[u8]) -> Option<PathBuf> {
    let (first, rest) = build_id.split_first()?;

    let mut name = String::with_capacity(rest.len() * 2 + 6);
    for b in rest {
        name.push_str(&format!("{b:02x}"));
    }
    name.push_str(".debug");

    let mut path = PathBuf::from(BUILD_ID_DIR);
    path.push(format!("{first:02x}"));
    path.push(name);
    Some(path)
}

/// Opens the debug file for the given build ID, if present.
///
/// The candidate is opened unconditionally: a file stored under the correct
/// content hash has no other consistency gate to pass.
pub fn open_by_build_id(build_id: &[u8]) -> Option<DebugFile> {
    let path = build_id_path(build_id)?;
    let file = File::load(&path).ok()?;

    debug!("debugfile: found build-id match at {}", path.display());

    Some(DebugFile {
        path,
        file: Arc::new(file),
    })
}

/// Opens a `.gnu_debuglink` target.
///
/// Probes `<dir>/<name>`, `<dir>/.debug/<name>` and
/// `/usr/lib/debug/<dir>/<name>`, where `<dir>` is the directory of the
/// primary module after resolving symlinks in its basename. A candidate is
/// accepted only if the CRC-32 over its full contents matches the recorded
/// checksum; a recorded checksum of zero disables the gate.
pub fn open_by_debug_link(primary: &Path, link: &GnuDebugLink, report: Report<'_>) -> Option<DebugFile> {
    let name = bytes_to_path(&link.path);

    for path in link_candidates(primary, &name) {
        let Ok(file) = File::load(&path) else {
            continue;
        };

        if link.crc != 0 {
            let got = crc32fast::hash(file.data());
            if got != link.crc {
                report(
                    &format!(
                        "debuglink candidate {} has CRC {got:#010x}, expected {:#010x}",
                        path.display(),
                        link.crc,
                    ),
                    0,
                );
                continue;
            }
        }

        debug!("debugfile: found debuglink match at {}", path.display());

        return Some(DebugFile {
            path,
            file: Arc::new(file),
        });
    }

    None
}

/// Opens a `.gnu_debugaltlink` (supplementary object file) target.
///
/// Absolute paths are taken as-is; relative ones go through the same probe
/// prefixes as debuglink. There is no CRC; when both sides carry a build ID
/// a mismatch disqualifies the candidate.
pub fn open_alt_link(primary: &Path, alt: &GnuDebugAltLink, report: Report<'_>) -> Option<DebugFile> {
    let name = bytes_to_path(&alt.path);

    let candidates: Vec<PathBuf> = if name.is_absolute() {
        vec![name]
    } else {
        link_candidates(primary, &name).collect()
    };

    for path in candidates {
        let Ok(file) = File::load(&path) else {
            continue;
        };
        let file = Arc::new(file);

        if !alt.build_id.is_empty() {
            let candidate_id = match Reader::parse(&file) {
                Ok(reader) => reader.build_id().ok().flatten().map(<[u8]>::to_vec),
                Err(_) => None,
            };

            if let Some(id) = candidate_id {
                if id != alt.build_id {
                    report(
                        &format!(
                            "debugaltlink candidate {} has a different build ID",
                            path.display(),
                        ),
                        0,
                    );
                    continue;
                }
            }
        }

        debug!("debugfile: found debugaltlink match at {}", path.display());
        return Some(DebugFile { path, file });
    }

    None
}

/// Opens the dSYM companion of a Mach-O image.
///
/// Scans sibling `*.dSYM` bundles and accepts the first companion under
/// `Contents/Resources/DWARF/` whose `LC_UUID` equals the primary's.
pub fn open_dsym(primary: &Path, uuid: [u8; 16], report: Report<'_>) -> Option<DebugFile> {
    let dir = primary.parent().unwrap_or(Path::new("."));

    for entry in fs::read_dir(dir).ok()?.flatten() {
        let bundle = entry.path();
        if bundle.extension().map_or(true, |ext| ext != "dSYM") {
            continue;
        }

        let dwarf_dir = bundle.join("Contents/Resources/DWARF");
        let Ok(companions) = fs::read_dir(&dwarf_dir) else {
            continue;
        };

        for companion in companions.flatten() {
            let path = companion.path();
            let Ok(file) = File::load(&path) else {
                continue;
            };
            let file = Arc::new(file);

            let companion_uuid = Reader::parse(&file)
                .ok()
                .and_then(|reader| reader.mach_uuid().ok().flatten());

            match companion_uuid {
                Some(found) if found == uuid => {
                    debug!("debugfile: found dSYM match at {}", path.display());
                    return Some(DebugFile { path, file });
                }
                Some(_) => {
                    report(
                        &format!("dSYM candidate {} has a different UUID", path.display()),
                        0,
                    );
                }
                None => {}
            }
        }
    }

    None
}

/// Yields the debuglink probe locations for the given file name.
fn link_candidates(primary: &Path, name: &Path) -> impl Iterator<Item = PathBuf> {
    let resolved = resolve_symlinks(primary);
    let dir = resolved
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let in_dir = dir.join(name);
    let in_debug_subdir = dir.join(DEBUG_SUBDIR).join(name);

    // `/usr/lib/debug/<dir>/<name>`: the module directory is re-rooted
    // under the system debug directory.
    let mut in_system = PathBuf::from(DEBUG_DIR);
    if let Ok(relative) = dir.strip_prefix("/") {
        in_system.push(relative);
    } else {
        in_system.push(&dir);
    }
    in_system.push(name);

    [in_dir, in_debug_subdir, in_system].into_iter()
}

/// Resolves symlinks in the given filename.
///
/// The module path is fairly likely to be something like `/proc/self/exe`,
/// so symlinks are common. Only the basename is rewritten for relative link
/// targets; the full path is replaced for absolute ones.
fn resolve_symlinks(path: &Path) -> PathBuf {
    let mut current = path.to_path_buf();

    for _ in 0..MAX_SYMLINK_DEPTH {
        let Ok(target) = fs::read_link(&current) else {
            break;
        };

        if target.is_absolute() {
            current = target;
        } else {
            current = match current.parent() {
                Some(parent) => parent.join(target),
                None => target,
            };
        }
    }

    current
}

/// Decodes a possibly non-UTF-8 path from section bytes.
#[cfg(unix)]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    PathBuf::from(OsStr::from_bytes(bytes))
}

/// Decodes a possibly non-UTF-8 path from section bytes.
#[cfg(not(unix))]
fn bytes_to_path(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}
