// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Symbol-table shards.
//!
//! A [`SymShard`] is an immutable, address-sorted snapshot of one module's
//! symbol table. It answers "which symbol covers this PC" by binary search
//! and is the fallback answer when no DWARF data is available. Names are
//! demangled and owned by the shard, so the source file can be dropped as
//! soon as the shard is built.

use crate::objfile::{Reader, SymbolSource};
use crate::state::Symbol;
use crate::{demangle, objfile, VirtAddr};

/// One address-sorted symbol table snapshot.
pub struct SymShard {
    syms: Vec<SymEntry>,
}

struct SymEntry {
    address: VirtAddr,
    size: u64,
    name: Box<str>,
}

impl SymShard {
    /// Extracts, relocates and sorts the symbols of the given table.
    ///
    /// Addresses are rebased by `bias` (the ASLR slide). On PowerPC64 ELFv1,
    /// symbol values pointing into `.opd` are replaced by the entry point
    /// stored in the function descriptor.
    pub fn build(
        reader: &Reader<'_>,
        source: SymbolSource,
        bias: VirtAddr,
    ) -> objfile::Result<Self> {
        let opd = reader.opd()?;

        let mut syms = Vec::new();
        for sym in reader.shard_symbols(source) {
            let mut address = sym.address;

            if let Some(opd) = &opd {
                if opd.contains(address) {
                    match opd.resolve(address) {
                        Some(resolved) => address = resolved,
                        None => continue,
                    }
                }
            }

            syms.push(SymEntry {
                address: address.wrapping_add(bias),
                size: sym.size,
                name: demangle::demangle(sym.name).into(),
            });
        }

        syms.sort_unstable_by_key(|s| (s.address, s.size));

        Ok(Self { syms })
    }

    /// Number of symbols in this shard.
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    /// Checks whether the shard has no symbols at all.
    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }

    /// Finds the symbol covering the given runtime address.
    ///
    /// An entry's extent is `[address, address + size)`. Zero-sized symbols
    /// extend to the next entry's address; a trailing zero-sized symbol
    /// matches everything above it, mirroring the historical behavior of
    /// symbolizers that probe with an end sentinel.
    pub fn lookup(&self, pc: VirtAddr) -> Option<Symbol<'_>> {
        let idx = self.syms.partition_point(|s| s.address <= pc).checked_sub(1)?;
        let entry = &self.syms[idx];

        let end = if entry.size > 0 {
            entry.address.saturating_add(entry.size)
        } else {
            self.syms
                .get(idx + 1)
                .map_or(VirtAddr::MAX, |next| next.address)
        };

        (pc < end).then(|| Symbol {
            name: &entry.name,
            address: entry.address,
            size: entry.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objfile::File;
    use object::write;
    use std::sync::Arc;

    /// Builds an ELF image with the given `(name, value, size, kind)`
    /// symbols, deliberately inserted out of address order.
    fn synth_elf_with_symbols(
        symbols: &[(&[u8], u64, u64, object::SymbolKind)],
    ) -> Arc<File> {
        let mut obj = write::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );

        let text = obj.add_section(vec![], b".text".to_vec(), object::SectionKind::Text);
        obj.section_mut(text).set_data(vec![0x90u8; 0x1000], 16);

        for &(name, value, size, kind) in symbols {
            obj.add_symbol(write::Symbol {
                name: name.to_vec(),
                value,
                size,
                kind,
                scope: object::SymbolScope::Linkage,
                weak: false,
                section: write::SymbolSection::Section(text),
                flags: object::SymbolFlags::None,
            });
        }

        Arc::new(File::from_bytes(obj.write().unwrap()))
    }

    fn shard(symbols: &[(&[u8], u64, u64, object::SymbolKind)], bias: VirtAddr) -> SymShard {
        let file = synth_elf_with_symbols(symbols);
        let reader = Reader::parse(&file).unwrap();
        SymShard::build(&reader, SymbolSource::Debug, bias).unwrap()
    }

    #[test]
    fn sorted_lookup() {
        use object::SymbolKind::Text;

        // Insertion order is shuffled; the shard must sort.
        let shard = shard(
            &[
                (b"charlie", 0x300, 0x80, Text),
                (b"alpha", 0x100, 0x40, Text),
                (b"bravo", 0x200, 0x100, Text),
            ],
            0,
        );
        assert_eq!(shard.len(), 3);

        let hit = shard.lookup(0x104).unwrap();
        assert_eq!(hit.name, "alpha");
        assert_eq!(hit.address, 0x100);
        assert_eq!(hit.size, 0x40);

        assert_eq!(shard.lookup(0x2ff).unwrap().name, "bravo");
        assert_eq!(shard.lookup(0x300).unwrap().name, "charlie");
        assert_eq!(shard.lookup(0x37f).unwrap().name, "charlie");

        // Below the first symbol and past the last one.
        assert!(shard.lookup(0x0ff).is_none());
        assert!(shard.lookup(0x380).is_none());

        // Gap between alpha's end and bravo's start.
        assert!(shard.lookup(0x140).is_none());
    }

    #[test]
    fn bias_is_applied() {
        use object::SymbolKind::Text;

        let shard = shard(&[(b"alpha", 0x100, 0x40, Text)], 0x7f00_0000);

        assert!(shard.lookup(0x104).is_none());
        let hit = shard.lookup(0x7f00_0104).unwrap();
        assert_eq!(hit.name, "alpha");
        assert_eq!(hit.address, 0x7f00_0100);
    }

    #[test]
    fn zero_sized_extends_to_next() {
        use object::SymbolKind::Text;

        let shard = shard(
            &[(b"start", 0x100, 0, Text), (b"next", 0x180, 0x10, Text)],
            0,
        );

        // Zero-sized symbol covers the gap up to the next entry.
        assert_eq!(shard.lookup(0x100).unwrap().name, "start");
        assert_eq!(shard.lookup(0x17f).unwrap().name, "start");
        assert_eq!(shard.lookup(0x180).unwrap().name, "next");
    }

    #[test]
    fn object_symbols_are_indexed() {
        use object::SymbolKind::{Data, Text};

        let shard = shard(
            &[(b"func", 0x100, 0x10, Text), (b"table", 0x800, 0x20, Data)],
            0,
        );

        assert_eq!(shard.lookup(0x810).unwrap().name, "table");
    }

    #[test]
    fn names_are_demangled() {
        use object::SymbolKind::Text;

        let shard = shard(
            &[(
                b"_ZN71_$LT$rustc_demangle..legacy..Demangle$u20$as$u20$core..fmt..Display$GT$3fmt17h48ee277748f854a8E",
                0x100,
                0x10,
                Text,
            )],
            0,
        );

        assert_eq!(
            shard.lookup(0x100).unwrap().name,
            "<rustc_demangle::legacy::Demangle as core::fmt::Display>::fmt",
        );
    }
}
