// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Container-level access to object files.
//!
//! The main types here are [`File`], which owns the raw bytes of an image
//! (either a memory mapping or a buffer, e.g. for decompressed MiniDebugInfo),
//! and [`Reader`], which parses the container structure on top of it. This
//! currently uses the [`object`] library to perform the actual heavy lifting,
//! however this should be considered an implementation detail.

use crate::{AnyError, VirtAddr};

use std::io::Read as _;
use std::sync::Arc;
use std::{fs, io, ops, path};

use flate2::read::ZlibDecoder;
use memmap2::{Mmap, MmapMut};
use object::{CompressionFormat, Object as _, ObjectSection as _, ObjectSymbol as _, SymbolKind};

/// Maximum size of an individual object section to keep in memory.
///
/// All sections where the decompressed representation is larger than this
/// constant are instead read into anonymous temporary files and `mmap`ed.
const SWAP_THRESH: usize = 16 * 1024 * 1024;

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors that can occur during object file parsing.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Container format is not supported")]
    UnsupportedFormat,

    #[error("Sections are compressed in an unsupported format")]
    UnsupportedCompressionFormat,

    #[error("Section data lies outside of the file")]
    BadSectionExtent,

    #[error("Object file is too big to be loaded")]
    FileTooBig,

    #[error("IO error")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Other(AnyError),
}

/// Conversion of [`object`] errors into ours, with type erasure.
///
/// We erase the type here to prevent leaking [`object`] library types into our
/// public interface. If code needs to special-case based on particular
/// [`object`] errors, we should instead lift them into custom error variants.
impl From<object::Error> for Error {
    fn from(e: object::Error) -> Self {
        Self::Other(Box::new(e))
    }
}

/// Identifies the container format of an object file.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Format {
    /// ELF, both the 32 and 64 bit variants.
    Elf,
    /// PE/COFF (PE32 and PE32+) and bare COFF objects.
    Coff,
    /// Mach-O, both widths and byte orders.
    MachO,
    /// XCOFF. Detected and parsed; no format-specific handling beyond that.
    Xcoff,
}

/// CPU architecture.
#[non_exhaustive]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Arch {
    /// `aarch64` aka `arm64`.
    Aarch64,
    /// `x86_64` aka `amd64`.
    X86_64,
    /// 64-bit PowerPC (the ELFv1 ABI uses `.opd` function descriptors).
    PowerPc64,
}

/// Raw bytes of an object file.
///
/// Files opened from disk are `mmap`ed to make reading more efficient;
/// in-memory images (decompressed MiniDebugInfo) are owned buffers. The
/// bytes are retained for the life of the value because sections hand out
/// views into them.
pub struct File(FileData);

enum FileData {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl File {
    /// Map the file at the given path into memory.
    pub fn load(path: &path::Path) -> Result<Self> {
        Self::load_file(&fs::File::open(path)?)
    }

    /// Map the given file into memory.
    pub fn load_file(file: &fs::File) -> Result<Self> {
        Ok(Self(FileData::Mapped(unsafe { Mmap::map(file)? })))
    }

    /// Wrap an in-memory image, e.g. a decompressed MiniDebugInfo ELF.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(FileData::Owned(bytes))
    }

    /// Raw bytes of the whole image.
    pub fn data(&self) -> &[u8] {
        match &self.0 {
            FileData::Mapped(m) => m,
            FileData::Owned(v) => v,
        }
    }
}

/// Provides read access to the data in an object file.
///
/// Created via [`Reader::parse`]. The reader borrows the [`File`] it was
/// created from; sections loaded through it keep the file alive on their own.
pub struct Reader<'f> {
    file: &'f Arc<File>,
    obj: object::File<'f>,
    format: Format,
}

impl<'f> Reader<'f> {
    /// Parse the container header and create a reader.
    pub fn parse(file: &'f Arc<File>) -> Result<Self> {
        let obj = object::File::parse(file.data())?;

        let format = match obj.format() {
            object::BinaryFormat::Elf => Format::Elf,
            object::BinaryFormat::Coff | object::BinaryFormat::Pe => Format::Coff,
            object::BinaryFormat::MachO => Format::MachO,
            object::BinaryFormat::Xcoff => Format::Xcoff,
            _ => return Err(Error::UnsupportedFormat),
        };

        Ok(Self { file, obj, format })
    }

    /// Returns the container format.
    pub fn format(&self) -> Format {
        self.format
    }

    /// Checks whether this file has little-endian byte-order.
    pub fn is_little_endian(&self) -> bool {
        self.obj.is_little_endian()
    }

    /// Checks whether this is a 64-bit image.
    pub fn is_64(&self) -> bool {
        self.obj.is_64()
    }

    /// Returns the architecture, or [`None`] if unknown.
    pub fn arch(&self) -> Option<Arch> {
        match self.obj.architecture() {
            object::Architecture::Aarch64 => Some(Arch::Aarch64),
            object::Architecture::X86_64 => Some(Arch::X86_64),
            object::Architecture::PowerPc64 => Some(Arch::PowerPc64),
            _ => None,
        }
    }

    /// Loads the section with the given name into memory.
    ///
    /// The name is given in ELF notation (`.debug_info`); the Mach-O
    /// (`__debug_info`) and GNU legacy compressed (`.zdebug_info`) spellings
    /// are probed automatically. Compressed sections (`SHF_COMPRESSED` with
    /// `ELFCOMPRESS_ZLIB`, or the `"ZLIB"` magic of `.zdebug_*`) are inflated
    /// transparently; this can be an expensive operation, so callers should
    /// store the returned instance if it is needed more than once.
    pub fn load_section(&self, name: &[u8]) -> Result<Option<Section>> {
        if let Some(obj_sec) = self.obj.section_by_name_bytes(name) {
            return self.load_obj_section(&obj_sec).map(Some);
        }

        // `.debug_info` -> `.zdebug_info`
        if let Some(stem) = name.strip_prefix(b".debug_") {
            let mut zname = b".zdebug_".to_vec();
            zname.extend_from_slice(stem);
            if let Some(obj_sec) = self.obj.section_by_name_bytes(&zname) {
                return self.load_obj_section(&obj_sec).map(Some);
            }
        }

        Ok(None)
    }

    /// Checks whether the image carries a non-empty `.debug_info` section.
    pub fn has_dwarf(&self) -> bool {
        for name in [&b".debug_info"[..], &b".zdebug_info"[..]] {
            if let Some(sec) = self.obj.section_by_name_bytes(name) {
                if sec.size() > 0 {
                    return true;
                }
            }
        }

        false
    }

    /// Reads the GNU build ID from the note sections, if present.
    ///
    /// Build IDs are 16-20 bytes in practice; the raw note payload is
    /// returned without a length check.
    pub fn build_id(&self) -> Result<Option<&'f [u8]>> {
        Ok(self.obj.build_id()?)
    }

    /// Reads the `LC_UUID` of a Mach-O image, if present.
    pub fn mach_uuid(&self) -> Result<Option<[u8; 16]>> {
        Ok(self.obj.mach_uuid()?)
    }

    /// Reads the contents of the `.gnu_debuglink` section.
    pub fn debug_link(&self) -> Result<Option<GnuDebugLink>> {
        Ok(self.obj.gnu_debuglink()?.map(|(path, crc)| GnuDebugLink {
            path: path.to_owned(),
            crc,
        }))
    }

    /// Reads the contents of the `.gnu_debugaltlink` section.
    pub fn debug_alt_link(&self) -> Result<Option<GnuDebugAltLink>> {
        Ok(self
            .obj
            .gnu_debugaltlink()?
            .map(|(path, build_id)| GnuDebugAltLink {
                path: path.to_owned(),
                build_id: build_id.to_owned(),
            }))
    }

    /// Loads the `.gnu_debugdata` (MiniDebugInfo) section, if present.
    pub fn gnu_debugdata(&self) -> Result<Option<Section>> {
        self.load_section(b".gnu_debugdata")
    }

    /// Loads the PowerPC64 ELFv1 `.opd` function-descriptor section.
    ///
    /// Returns [`None`] for every other architecture or when the section is
    /// missing.
    pub fn opd(&self) -> Result<Option<OpdData>> {
        if self.arch() != Some(Arch::PowerPc64) || self.format != Format::Elf {
            return Ok(None);
        }

        let Some(section) = self.load_section(b".opd")? else {
            return Ok(None);
        };

        Ok(Some(OpdData {
            little_endian: self.is_little_endian(),
            section,
        }))
    }

    /// Iterate over indexable symbols from the given table.
    ///
    /// Yields function symbols, plus object symbols for everything but
    /// PE/COFF, skipping undefined entries and the bogus records that
    /// compilers like to emit at address zero. 32-bit COFF names have their
    /// leading underscore stripped.
    pub fn shard_symbols(&self, source: SymbolSource) -> impl Iterator<Item = Symbol<'f>> + '_ {
        let iter = match source {
            SymbolSource::Debug => self.obj.symbols(),
            SymbolSource::Dynamic => self.obj.dynamic_symbols(),
        };

        let coff = self.format == Format::Coff;
        let strip_underscore = coff && !self.is_64();

        iter.filter(move |x| match x.kind() {
            SymbolKind::Text => true,
            SymbolKind::Data => !coff,
            _ => false,
        })
        .filter(|x| x.section_index().is_some())
        .filter(|x| x.address() != 0)
        .filter_map(move |x| {
            let mut name = x.name().ok()?; // just skip non-utf8 symbols
            if strip_underscore {
                name = name.strip_prefix('_').unwrap_or(name);
            }

            Some(Symbol {
                name,
                address: x.address(),
                size: x.size(),
            })
        })
    }

    /// Checks whether the given symbol table has any entries at all.
    pub fn has_symbols(&self, source: SymbolSource) -> bool {
        match source {
            SymbolSource::Debug => self.obj.symbols().next().is_some(),
            SymbolSource::Dynamic => self.obj.dynamic_symbols().next().is_some(),
        }
    }

    fn load_obj_section(&self, obj_sec: &object::Section<'f, '_>) -> Result<Section> {
        let compressed = obj_sec.compressed_data()?;

        let data = match compressed.format {
            CompressionFormat::None => {
                // Keep a window into the backing file instead of copying.
                match obj_sec.file_range() {
                    Some((offset, size)) => {
                        let start = usize::try_from(offset).map_err(|_| Error::BadSectionExtent)?;
                        let len = usize::try_from(size).map_err(|_| Error::BadSectionExtent)?;
                        let end = start.checked_add(len).ok_or(Error::BadSectionExtent)?;
                        if end > self.file.data().len() {
                            return Err(Error::BadSectionExtent);
                        }
                        SectionData::FileRange(start..end)
                    }
                    None => SectionData::InMemory(compressed.data.to_vec()),
                }
            }

            CompressionFormat::Zlib => {
                let final_size: usize = compressed
                    .uncompressed_size
                    .try_into()
                    .map_err(|_| Error::FileTooBig)?;

                let decoder = ZlibDecoder::new(compressed.data).take(final_size as u64);
                SectionData::read_smart(final_size, decoder)?
            }

            // Anything else (e.g. zstd) is out of scope here.
            _ => return Err(Error::UnsupportedCompressionFormat),
        };

        Ok(Section {
            virt_addr: obj_sec.address(),
            virt_size: obj_sec.size(),
            file: Arc::clone(self.file),
            data,
        })
    }
}

/// Information and raw data of an object file section.
///
/// Owns a reference to the backing [`File`], so it can outlive the [`Reader`]
/// that created it. This matters because debug sections are referenced by
/// loaded modules for the life of the process.
pub struct Section {
    virt_addr: VirtAddr,
    virt_size: u64,
    file: Arc<File>,
    data: SectionData,
}

impl Section {
    /// Wraps an owned buffer as a section, for synthesized section data.
    #[cfg(test)]
    pub(crate) fn from_owned(bytes: Vec<u8>) -> Self {
        Section {
            virt_addr: 0,
            virt_size: bytes.len() as u64,
            file: Arc::new(File::from_bytes(Vec::new())),
            data: SectionData::InMemory(bytes),
        }
    }

    /// Returns the virtual address of the first byte of this section.
    pub fn virt_addr(&self) -> VirtAddr {
        self.virt_addr
    }

    /// Returns the virtual address range of the section.
    pub fn va_range(&self) -> ops::Range<VirtAddr> {
        self.virt_addr..self.virt_addr + self.virt_size
    }
}

/// Allow using section objects where slices are expected.
impl ops::Deref for Section {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.data {
            SectionData::FileRange(r) => &self.file.data()[r.clone()],
            SectionData::InMemory(x) => &x[..],
            SectionData::Swapped(x) => &x[..],
        }
    }
}

/// Storage for object file sections.
enum SectionData {
    /// Section was uncompressed in the input file; we keep a window into it.
    FileRange(ops::Range<usize>),

    /// Section was originally compressed and we decompressed it into memory.
    InMemory(Vec<u8>),

    /// Section was originally compressed and we decompressed it into a
    /// memory-mapped temporary file.
    Swapped(MmapMut),
}

impl SectionData {
    /// Create [`Self::InMemory`] variant from a reader.
    fn read_into_memory(final_size: usize, mut reader: impl io::Read) -> Result<Self> {
        let mut mem_buf = Vec::with_capacity(final_size);
        reader.read_to_end(&mut mem_buf)?;
        Ok(SectionData::InMemory(mem_buf))
    }

    /// Create [`Self::Swapped`] variant from a reader.
    fn read_into_swap(mut reader: impl io::Read) -> Result<Self> {
        let mut file = tempfile::tempfile()?;
        io::copy(&mut reader, &mut file)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(SectionData::Swapped(mmap))
    }

    /// Creates a variant of the [`SectionData`] enum most appropriate for the
    /// given size.
    ///
    /// Decompressed sections are either decoded into memory or into `mmap`ed
    /// temporary files based on their size.
    fn read_smart(final_size: usize, reader: impl io::Read) -> Result<Self> {
        if final_size >= SWAP_THRESH {
            Self::read_into_swap(reader)
        } else {
            Self::read_into_memory(final_size, reader)
        }
    }
}

/// Parsed contents of the `.gnu_debuglink` section.
#[derive(Debug, Clone)]
pub struct GnuDebugLink {
    /// File name of the separate debug file, without any directory part.
    ///
    /// May contain non UTF-8 characters, hence represented as raw bytes.
    pub path: Vec<u8>,

    /// CRC-32 of the debug file's contents (GNU debuglink flavor).
    ///
    /// A value of `0` disables the checksum gate.
    pub crc: u32,
}

/// Parsed contents of the `.gnu_debugaltlink` section.
#[derive(Debug, Clone)]
pub struct GnuDebugAltLink {
    /// Relative or absolute path to the supplementary debug file.
    ///
    /// May contain non UTF-8 characters, hence represented as raw bytes.
    pub path: Vec<u8>,

    /// GNU build ID expected in the supplementary debug file.
    pub build_id: Vec<u8>,
}

/// PowerPC64 ELFv1 `.opd` function-descriptor data.
pub struct OpdData {
    little_endian: bool,
    section: Section,
}

impl OpdData {
    /// Checks whether the given symbol value lies within `.opd`.
    pub fn contains(&self, addr: VirtAddr) -> bool {
        self.section.va_range().contains(&addr)
    }

    /// Chases a function descriptor: reads the entry-point address stored at
    /// the descriptor's offset within `.opd`.
    pub fn resolve(&self, addr: VirtAddr) -> Option<VirtAddr> {
        let offset = usize::try_from(addr.checked_sub(self.section.virt_addr())?).ok()?;
        let bytes: [u8; 8] = self.section.get(offset..offset + 8)?.try_into().ok()?;

        Some(if self.little_endian {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        })
    }
}

/// Specifies an object symbol source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolSource {
    /// Debug symbol table (`.symtab`).
    Debug,

    /// Dynamic symbol table (`.dynsym`).
    Dynamic,
}

/// Basic executable symbol record.
#[derive(Debug, Clone)]
pub struct Symbol<'a> {
    /// Symbol name. Might be mangled.
    pub name: &'a str,
    /// Start address of the symbol, as recorded in the file.
    pub address: VirtAddr,
    /// Size of the symbol. Zero-sized symbols are common and legal.
    pub size: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::ZlibEncoder;
    use flate2::Compression;
    use object::write;
    use std::io::Write as _;

    /// Builds a minimal ELF image with the given extra sections.
    pub fn synth_elf(sections: &[(&[u8], &[u8])]) -> Arc<File> {
        let mut obj = write::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );

        let text = obj.add_section(vec![], b".text".to_vec(), object::SectionKind::Text);
        obj.section_mut(text).set_data(vec![0x90u8; 0x40], 16);

        for (name, data) in sections {
            // Build-id notes must land in an SHT_NOTE section to be found.
            let kind = if name.starts_with(b".note") {
                object::SectionKind::Note
            } else {
                object::SectionKind::Metadata
            };

            let id = obj.add_section(vec![], name.to_vec(), kind);
            obj.section_mut(id).set_data(data.to_vec(), 4);
        }

        Arc::new(File::from_bytes(obj.write().unwrap()))
    }

    fn zlib_compress(data: &[u8]) -> Vec<u8> {
        let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn plain_section() {
        let file = synth_elf(&[(b".debug_info", b"payload bytes")]);
        let reader = Reader::parse(&file).unwrap();

        assert_eq!(reader.format(), Format::Elf);
        assert!(reader.is_little_endian());
        assert!(reader.has_dwarf());

        let sec = reader.load_section(b".debug_info").unwrap().unwrap();
        assert!(matches!(sec.data, SectionData::FileRange(_)));
        assert_eq!(&sec[..], b"payload bytes");

        assert!(reader.load_section(b".debug_nonexistent").unwrap().is_none());
    }

    #[test]
    fn zdebug_section() {
        // GNU legacy format: "ZLIB" magic + big-endian uncompressed size.
        let payload = b"the uncompressed debug bytes".to_vec();
        let mut data = b"ZLIB".to_vec();
        data.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        data.extend_from_slice(&zlib_compress(&payload));

        let file = synth_elf(&[(b".zdebug_info", &data)]);
        let reader = Reader::parse(&file).unwrap();

        assert!(reader.has_dwarf());

        // Probed under its `.debug_` name.
        let sec = reader.load_section(b".debug_info").unwrap().unwrap();
        assert!(matches!(sec.data, SectionData::InMemory(_)));
        assert_eq!(&sec[..], &payload[..]);
    }

    #[test]
    fn debug_link_roundtrip() {
        // Name, nul terminator, padding to 4, little-endian CRC.
        let mut data = b"app.debug\0\0\0".to_vec();
        data.extend_from_slice(&0xdeadbeefu32.to_le_bytes());

        let file = synth_elf(&[(b".gnu_debuglink", &data)]);
        let reader = Reader::parse(&file).unwrap();

        let link = reader.debug_link().unwrap().unwrap();
        assert_eq!(link.path, b"app.debug");
        assert_eq!(link.crc, 0xdeadbeef);
    }

    #[test]
    fn build_id_note() {
        // Note header: namesz = 4, descsz = 8, type = NT_GNU_BUILD_ID.
        let mut note = Vec::new();
        note.extend_from_slice(&4u32.to_le_bytes());
        note.extend_from_slice(&8u32.to_le_bytes());
        note.extend_from_slice(&3u32.to_le_bytes());
        note.extend_from_slice(b"GNU\0");
        note.extend_from_slice(&[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0]);

        let file = synth_elf(&[(b".note.gnu.build-id", &note)]);
        let reader = Reader::parse(&file).unwrap();

        let id = reader.build_id().unwrap().unwrap();
        assert_eq!(id, &[0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0]);
    }

    #[test]
    fn alt_link() {
        let mut data = b"meow\0".to_vec();
        let id: Vec<u8> = (0..20).collect();
        data.extend_from_slice(&id);

        let file = synth_elf(&[(b".gnu_debugaltlink", &data)]);
        let reader = Reader::parse(&file).unwrap();

        let alt = reader.debug_alt_link().unwrap().unwrap();
        assert_eq!(alt.path, b"meow");
        assert_eq!(alt.build_id, id);
    }
}
