// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! PC to file/line/function resolution.
//!
//! A [`ModuleIndex`] wraps the DWARF sections of one loaded module. At
//! construction time only the compilation-unit headers and their covering PC
//! ranges are scanned. The expensive parts (the executed line program and the
//! function/inline tree) are decoded on the first query that hits a unit and
//! cached as owned, immutable tables. Queries after that first hit never
//! touch the raw DWARF again.

use crate::state::{Frame, Report};
use crate::{demangle, dwarf, VirtAddr};

use fallible_iterator::FallibleIterator;
use intervaltree::{Element, IntervalTree};
use std::cmp;
use std::collections::HashMap;
use std::num::NonZeroU64;
use std::ops::Range;
use std::sync::{Arc, OnceLock};

/// PC lookup index for the DWARF data of one module.
pub struct ModuleIndex {
    /// Difference between runtime addresses and the file addresses used by
    /// the DWARF data (the ASLR slide).
    bias: VirtAddr,

    store: dwarf::SectionStore,

    /// One slot per indexable compilation unit.
    units: Vec<UnitSlot>,

    /// Covering ranges of all units, sorted by start. File relative.
    cover: Vec<CoverEntry>,
}

struct CoverEntry {
    range: Range<VirtAddr>,
    unit: u32,
}

struct UnitSlot {
    offset: gimli::DebugInfoOffset,

    /// Decoded tables, built on first hit. `None` after a failed build.
    tables: OnceLock<Option<UnitTables>>,
}

/// Owned lookup tables for one compilation unit.
struct UnitTables {
    /// Resolved source file paths referenced by rows and call sites.
    files: Vec<Arc<str>>,

    /// Line rows as half-open ranges, sorted by start address.
    rows: Vec<LineRow>,

    /// Function and inline-instance records keyed by their PC ranges.
    funcs: IntervalTree<VirtAddr, FuncRec>,
}

struct LineRow {
    range: Range<VirtAddr>,
    file: u32,
    line: u32,
    column: u32,
}

#[derive(Clone)]
struct FuncRec {
    /// Demangled function name.
    name: Option<Arc<str>>,

    /// Depth in the inline tree; `0` is the enclosing subprogram.
    depth: u32,

    /// Call site of this inline instance, within the caller.
    call_file: Option<u32>,
    call_line: u32,
    call_column: u32,
}

impl UnitTables {
    fn file(&self, idx: u32) -> Option<&str> {
        self.files.get(idx as usize).map(|x| &**x)
    }

    /// Finds the greatest line row whose start does not exceed `rel` and
    /// whose range contains it.
    fn row_for(&self, rel: VirtAddr) -> Option<&LineRow> {
        let idx = self.rows.partition_point(|r| r.range.start <= rel);
        self.rows
            .get(idx.checked_sub(1)?)
            .filter(|r| rel < r.range.end)
    }
}

impl ModuleIndex {
    /// Scans the unit headers and builds the covering-range index.
    ///
    /// Units with broken headers or unusable range data are reported through
    /// `report` (errnum 0) and skipped; the index degrades instead of
    /// failing.
    pub fn new(store: dwarf::SectionStore, bias: VirtAddr, report: Report<'_>) -> Self {
        let mut units = Vec::new();
        let mut cover = Vec::new();

        match store.units() {
            Ok(all) => {
                let mut iter = all.iter();
                loop {
                    let unit = match iter.next() {
                        Ok(Some(unit)) => unit,
                        Ok(None) => break,
                        Err(e) => {
                            report(&format!("skipping unit with broken header: {e}"), 0);
                            continue;
                        }
                    };

                    match Self::collect_ranges(&unit, report) {
                        Ok(ranges) if !ranges.is_empty() => {
                            let idx = units.len() as u32;
                            units.push(UnitSlot {
                                offset: unit.info_offset(),
                                tables: OnceLock::new(),
                            });

                            for range in ranges {
                                cover.push(CoverEntry { range, unit: idx });
                            }
                        }

                        // No PC coverage: nothing to index for this unit.
                        Ok(_) => {}

                        Err(e) => {
                            report(&format!("skipping unit {unit:?}: {e}"), 0);
                        }
                    }
                }
            }

            Err(e) => {
                report(&format!("cannot index compilation units: {e}"), 0);
            }
        }

        cover.sort_unstable_by_key(|c| (c.range.start, c.range.end));

        Self {
            bias,
            store,
            units,
            cover,
        }
    }

    /// The bias this index was registered with.
    pub fn bias(&self) -> VirtAddr {
        self.bias
    }

    /// Reads the covering ranges of a unit, normalized to sorted, merged,
    /// half-open intervals.
    fn collect_ranges(
        unit: &dwarf::Unit<'_, '_>,
        report: Report<'_>,
    ) -> dwarf::Result<Vec<Range<VirtAddr>>> {
        let mut ranges = Vec::new();

        let mut iter = unit.ranges()?;
        while let Some(range) = iter.next()? {
            if range.end < range.start {
                report(
                    &format!(
                        "unit {unit:?} has inverted range {:#x}..{:#x}",
                        range.start, range.end,
                    ),
                    0,
                );
                continue;
            }

            if !range.is_empty() {
                ranges.push(range);
            }
        }

        ranges.sort_unstable_by_key(|r| (r.start, r.end));
        ranges.dedup_by(|next, prev| {
            if next.start <= prev.end {
                prev.end = prev.end.max(next.end);
                true
            } else {
                false
            }
        });

        Ok(ranges)
    }

    /// Resolves a runtime PC to its frame chain, innermost first.
    ///
    /// The innermost frame carries the matched line-table row; each enclosing
    /// frame carries the call site of the frame nested within it; the
    /// outermost frame carries the subprogram's own name. Returns [`None`]
    /// when the PC is not covered by this module's debug info.
    pub fn find_frames<'s>(
        &'s self,
        pc: VirtAddr,
        report: Report<'_>,
    ) -> Option<Vec<Frame<'s>>> {
        let rel = pc.checked_sub(self.bias)?;

        let idx = self
            .cover
            .partition_point(|c| c.range.start <= rel)
            .checked_sub(1)?;
        let entry = &self.cover[idx];
        if rel >= entry.range.end {
            return None;
        }

        let slot = &self.units[entry.unit as usize];
        let tables = slot
            .tables
            .get_or_init(|| match self.build_tables(slot.offset) {
                Ok(tables) => Some(tables),
                Err(e) => {
                    report(&format!("cannot decode unit tables: {e}"), 0);
                    None
                }
            })
            .as_ref()?;

        let row = tables.row_for(rel);

        let mut chain: Vec<&FuncRec> = tables.funcs.query_point(rel).map(|e| &e.value).collect();

        if chain.is_empty() {
            // No function record: a bare line row still makes a frame.
            let row = row?;
            return Some(vec![Frame {
                pc,
                file: tables.file(row.file),
                line: row.line,
                column: row.column,
                function: None,
            }]);
        }

        // Innermost (deepest) first. Malformed trees can yield overlapping
        // siblings; keep one record per depth.
        chain.sort_unstable_by_key(|r| cmp::Reverse(r.depth));
        chain.dedup_by_key(|r| r.depth);

        let mut frames = Vec::with_capacity(chain.len());
        for (i, rec) in chain.iter().enumerate() {
            let frame = if i == 0 {
                // The innermost frame gets the line-table position.
                Frame {
                    pc,
                    file: row.map(|r| tables.file(r.file)).unwrap_or_default(),
                    line: row.map_or(0, |r| r.line),
                    column: row.map_or(0, |r| r.column),
                    function: rec.name.as_deref(),
                }
            } else {
                // Enclosing frames get the call site of the inlinee they
                // contain.
                let inner = chain[i - 1];
                Frame {
                    pc,
                    file: inner.call_file.and_then(|f| tables.file(f)),
                    line: inner.call_line,
                    column: inner.call_column,
                    function: rec.name.as_deref(),
                }
            };

            frames.push(frame);
        }

        Some(frames)
    }

    /// Decodes the line program and function tree of one unit.
    fn build_tables(&self, offset: gimli::DebugInfoOffset) -> dwarf::Result<UnitTables> {
        let units = self.store.units()?;
        let Some(unit) = units.unit_at(offset)? else {
            return Err(dwarf::Error::BadUnitRef);
        };

        let comp_dir = unit.comp_dir().map(|dir| dir.into_owned());
        let mut files = FileInterner::default();

        // Execute the line program into sorted, half-open rows.
        let mut rows = Vec::new();
        if let Some(mut line_iter) = unit.line_iter() {
            while let Some(entry) = line_iter.next()? {
                if entry.rng.is_empty() {
                    continue;
                }

                rows.push(LineRow {
                    file: files.intern(&entry.file, comp_dir.as_deref()),
                    range: entry.rng,
                    line: clamp_u32(entry.line.map_or(0, NonZeroU64::get)),
                    column: clamp_u32(entry.column.map_or(0, NonZeroU64::get)),
                });
            }
        }
        rows.sort_unstable_by_key(|r| (r.range.start, r.range.end));

        // Walk subprograms and their inline instances into interval-tree
        // elements, one per PC range.
        let mut elements = Vec::new();
        let mut sp_iter = unit.subprograms();
        while let Some(sub) = sp_iter.next()? {
            let mut item_iter = sub.into_iter();
            while let Some(mut info) = item_iter.next()? {
                let Some(mut ranges) = info.take_ranges() else {
                    continue;
                };

                let name = info
                    .name()?
                    .map(|n| Arc::<str>::from(demangle::demangle(&n).as_ref()));

                let call_file = match info.call_file()? {
                    Some(file) => Some(files.intern(&file, comp_dir.as_deref())),
                    None => None,
                };

                let rec = FuncRec {
                    name,
                    depth: clamp_u32(info.depth()),
                    call_file,
                    call_line: clamp_u32(info.call_line().map_or(0, NonZeroU64::get)),
                    call_column: clamp_u32(info.call_column().map_or(0, NonZeroU64::get)),
                };

                while let Some(range) = ranges.next()? {
                    // Ranges starting at 0 or 1 are relocation bugs, not
                    // actual code.
                    if range.start <= 1 || range.end <= range.start {
                        continue;
                    }

                    elements.push(Element {
                        range,
                        value: rec.clone(),
                    });
                }
            }
        }

        Ok(UnitTables {
            files: files.paths,
            rows,
            funcs: IntervalTree::from_iter(elements),
        })
    }
}

fn clamp_u32(x: u64) -> u32 {
    x.min(u32::MAX as u64) as u32
}

/// Deduplicates resolved source-file paths within one unit.
#[derive(Default)]
struct FileInterner {
    by_id: HashMap<dwarf::SourceFileId, u32>,
    paths: Vec<Arc<str>>,
}

impl FileInterner {
    fn intern(&mut self, file: &dwarf::SourceFile<'_>, comp_dir: Option<&str>) -> u32 {
        if let Some(&idx) = self.by_id.get(&file.id) {
            return idx;
        }

        let idx = self.paths.len() as u32;
        self.paths.push(Arc::from(file.full_path(comp_dir)));
        self.by_id.insert(file.id, idx);
        idx
    }
}
