// Copyright The OpenTelemetry Authors
// SPDX-License-Identifier: Apache-2.0

//! Process-wide symbolization state.
//!
//! A [`State`] owns everything needed to answer PC queries: one symbol shard
//! and (when debug info exists) one DWARF index per loaded module. Modules
//! are discovered through the dynamic linker and registered behind lock-free
//! lists: writers publish fully-built, immutable shards by prepending to a
//! list head, readers traverse with acquire loads and never block. Loading
//! problems are reported through an optional error callback and degrade the
//! answer instead of failing the query.

use crate::fileline::ModuleIndex;
use crate::symtab::SymShard;
use crate::{debug, debugfile, dwarf, minidebug, objfile, AnyError, VirtAddr};

use std::collections::HashSet;
use std::io::Write as _;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex};
use std::{fmt, fs, io, ptr};

/// Errnum value reported for malformed or inconsistent input.
///
/// Candidates that fail a gate (CRC, UUID) and structurally broken sections
/// report this; they are skipped, not fatal.
pub const ERRNUM_MALFORMED: i32 = 0;

/// Errnum value reported when a module simply has no debug info.
///
/// Informational, reported once per module.
pub const ERRNUM_NO_DEBUG_INFO: i32 = -1;

/// Callback receiving non-fatal problem reports.
///
/// The second argument is an errnum: a positive value is an OS error code,
/// [`ERRNUM_MALFORMED`] flags malformed input and [`ERRNUM_NO_DEBUG_INFO`]
/// is informational. The callback may be invoked zero or more times per
/// query and any number of times during loading.
pub type ErrorCallback = Box<dyn Fn(&str, i32) + Send + Sync>;

/// Internal report sink: borrowed, allocation-light flavor of
/// [`ErrorCallback`] that the loading and lookup paths pass around.
pub type Report<'a> = &'a dyn Fn(&str, i32);

/// Visitor receiving one [`Frame`] per call, outer frames after inner ones.
///
/// Returning an error aborts the query and surfaces the error to the caller
/// of [`State::pc_full`].
pub type FrameVisitor<'a> = &'a mut dyn FnMut(&Frame<'_>) -> Result<(), AnyError>;

/// One stack frame's worth of symbolization data.
///
/// Fields are `None` (or `0`) when unknown. For inlined calls, one PC
/// resolves to several frames: the innermost inlinee first, each enclosing
/// function after it, the actual subprogram last.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    /// The queried program counter.
    pub pc: VirtAddr,

    /// Source file path.
    pub file: Option<&'a str>,

    /// 1-based source line, `0` when unknown.
    pub line: u32,

    /// 1-based source column, `0` when unknown.
    pub column: u32,

    /// Demangled function name.
    pub function: Option<&'a str>,
}

/// A symbol-table answer: the symbol covering a PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol<'a> {
    /// Demangled symbol name.
    pub name: &'a str,

    /// Runtime start address of the symbol.
    pub address: VirtAddr,

    /// Size of the symbol; `0` when the table did not record one.
    pub size: u64,
}

/// Result type shorthand.
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Errors surfaced by [`State`] construction.
#[non_exhaustive]
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot open executable")]
    Io(#[from] io::Error),

    #[error("objfile: {0}")]
    Objfile(#[from] objfile::Error),
}

/// Process-wide symbolization state.
///
/// Cheap to query, expensive to create. Create one per process and share it;
/// with `threaded` set at creation, all query methods may be called from any
/// number of threads concurrently.
pub struct State {
    threaded: bool,
    error_cb: Option<ErrorCallback>,

    /// Whether queries may consult the dynamic linker for new modules.
    discover: bool,

    /// Path of the primary executable, if one was given or could be
    /// determined. Used as the name of the dynamic linker's anonymous
    /// main-program entry.
    primary: Option<PathBuf>,

    /// One entry per module with usable symbols.
    symtabs: ShardList<SymModule>,

    /// One entry per module with usable DWARF data.
    dwarfs: ShardList<DwarfModule>,

    /// Modules we already tried to load, successfully or not. Serializes
    /// writers; readers never touch it.
    attempted: Mutex<HashSet<(PathBuf, VirtAddr)>>,
}

struct SymModule {
    path: PathBuf,
    shard: SymShard,
}

struct DwarfModule {
    path: PathBuf,
    index: ModuleIndex,
}

impl State {
    /// Creates a state for the running process.
    ///
    /// `filename` overrides the path of the main executable (useful when
    /// `/proc/self/exe` style discovery is unavailable or wrong); when given
    /// it must exist. `threaded` must be set if the state will be queried
    /// from more than one thread. `error_callback` receives non-fatal
    /// problem reports; pass [`None`] to drop them.
    ///
    /// All currently loaded modules are registered eagerly; modules loaded
    /// later are picked up when a query misses.
    pub fn new(
        filename: Option<&Path>,
        threaded: bool,
        error_callback: Option<ErrorCallback>,
    ) -> Result<Self> {
        if let Some(path) = filename {
            fs::metadata(path)?;
        }

        let mut state = Self::empty_impl(filename, threaded, error_callback);
        state.discover = true;
        state.scan_images();
        Ok(state)
    }

    /// Creates a state with no modules registered.
    ///
    /// Useful for embedders with their own module tracking: register each
    /// image explicitly with [`State::register_module`]. Queries never
    /// consult the dynamic linker on such a state.
    pub fn empty(threaded: bool, error_callback: Option<ErrorCallback>) -> Self {
        Self::empty_impl(None, threaded, error_callback)
    }

    fn empty_impl(
        filename: Option<&Path>,
        threaded: bool,
        error_cb: Option<ErrorCallback>,
    ) -> Self {
        Self {
            threaded,
            error_cb,
            discover: false,
            primary: filename.map(Path::to_path_buf),
            symtabs: ShardList::new(),
            dwarfs: ShardList::new(),
            attempted: Mutex::new(HashSet::new()),
        }
    }

    /// Registers one module at the given load bias.
    ///
    /// The bias is the difference between runtime addresses and the
    /// addresses recorded in the file (zero for non-relocated executables).
    /// Loading is idempotent per `(path, base)` pair.
    pub fn register_module(&self, path: &Path, base: VirtAddr) -> Result {
        let mut attempted = lock(&self.attempted);
        if !attempted.insert((path.to_path_buf(), base)) {
            return Ok(());
        }

        Ok(self.load_module(path, base)?)
    }

    /// Resolves a PC to source frames, invoking `visitor` once per frame.
    ///
    /// Inline chains produce several calls, innermost first; the outermost
    /// frame carries the enclosing subprogram. When no file/line data exists
    /// the visitor is invoked exactly once, with the symbol-table name if
    /// one is known and an otherwise empty frame.
    ///
    /// Returns `true` iff at least one frame with file/line data was
    /// delivered.
    pub fn pc_full(&self, pc: VirtAddr, visitor: FrameVisitor<'_>) -> std::result::Result<bool, AnyError> {
        if let Some(()) = self.visit_frames(pc, visitor)? {
            return Ok(true);
        }

        // Miss: a module loaded after the last scan may cover the PC.
        if self.rescan() {
            if let Some(()) = self.visit_frames(pc, visitor)? {
                return Ok(true);
            }
        }

        // No debug info for this PC. Per contract the visitor still runs
        // once, with the symbol name when one exists.
        let frame = Frame {
            pc,
            file: None,
            line: 0,
            column: 0,
            function: self.lookup_symbol(pc).map(|sym| sym.name),
        };
        visitor(&frame)?;

        Ok(false)
    }

    /// Finds the symbol covering a PC.
    pub fn pc_symbol(&self, pc: VirtAddr) -> Option<Symbol<'_>> {
        if self.lookup_symbol(pc).is_none() {
            self.rescan();
        }

        self.lookup_symbol(pc)
    }

    /// Prints the frames for a PC, one line each, in `addr2line` style.
    ///
    /// Convenience composition of [`State::pc_full`] and
    /// [`State::pc_symbol`].
    pub fn pc_print(&self, pc: VirtAddr, out: &mut dyn io::Write) -> io::Result<()> {
        let mut printed = false;
        let mut failure = None;

        {
            let mut visitor = |frame: &Frame<'_>| -> std::result::Result<(), AnyError> {
                let result = match (frame.function, frame.file) {
                    (None, None) => return Ok(()),
                    (function, Some(file)) => writeln!(
                        out,
                        "{:#x} {} at {}:{}",
                        frame.pc,
                        function.unwrap_or("??"),
                        file,
                        frame.line,
                    ),
                    (Some(function), None) => writeln!(out, "{:#x} {}", frame.pc, function),
                };

                printed = true;
                result.map_err(AnyError::from)
            };

            if let Err(e) = self.pc_full(pc, &mut visitor) {
                match e.downcast::<io::Error>() {
                    Ok(io_err) => return Err(*io_err),
                    Err(other) => failure = Some(other),
                }
            }
        }

        if let Some(failure) = failure {
            return Err(io::Error::other(failure));
        }

        if !printed {
            writeln!(out, "{pc:#x} ??")?;
        }

        Ok(())
    }

    /// Walks the DWARF modules; `Some(())` means frames were delivered.
    fn visit_frames(
        &self,
        pc: VirtAddr,
        visitor: FrameVisitor<'_>,
    ) -> std::result::Result<Option<()>, AnyError> {
        let report = self.reporter();

        for module in self.dwarfs.iter() {
            let Some(frames) = module.index.find_frames(pc, &report) else {
                continue;
            };

            if frames.is_empty() {
                continue;
            }

            // Stripped-plus-DWARF mixtures exist; when the subprogram DIE
            // had no name, borrow it from the symbol table.
            let fallback = match frames.last() {
                Some(outer) if outer.function.is_none() => self.lookup_symbol(pc),
                _ => None,
            };

            let last = frames.len() - 1;
            for (i, frame) in frames.iter().enumerate() {
                if i == last && frame.function.is_none() {
                    if let Some(sym) = &fallback {
                        visitor(&Frame {
                            function: Some(sym.name),
                            ..*frame
                        })?;
                        continue;
                    }
                }

                visitor(frame)?;
            }

            return Ok(Some(()));
        }

        Ok(None)
    }

    fn lookup_symbol(&self, pc: VirtAddr) -> Option<Symbol<'_>> {
        self.symtabs.iter().find_map(|m| m.shard.lookup(pc))
    }

    /// Registers any images the dynamic linker knows about that we have not
    /// seen yet. Returns whether anything new was loaded.
    fn rescan(&self) -> bool {
        // A state built via `State::empty` never consults the linker.
        if !self.discover {
            return false;
        }

        self.scan_images()
    }

    fn scan_images(&self) -> bool {
        let images = platform::discover_images(self.primary.as_deref());

        let mut any_new = false;
        let mut attempted = lock(&self.attempted);

        for image in images {
            if !attempted.insert((image.path.clone(), image.base)) {
                continue;
            }

            any_new = true;
            if let Err(e) = self.load_module(&image.path, image.base) {
                self.report(
                    &format!("cannot load module {}: {e}", image.path.display()),
                    load_errnum(&e),
                );
            }
        }

        any_new
    }

    /// Loads one module: symbol shard, separate debug file resolution and
    /// DWARF index, then publishes whatever could be built.
    fn load_module(&self, path: &Path, bias: VirtAddr) -> objfile::Result {
        let report = self.reporter();

        let file = Arc::new(objfile::File::load(path)?);
        let reader = objfile::Reader::parse(&file)?;

        // Symbol shard from `.symtab`, falling back to `.dynsym`.
        let mut shard = self.build_symbols(&reader, bias);

        // MiniDebugInfo: an XZ-compressed ELF carrying only a symbol table,
        // for modules whose own tables were stripped.
        if shard.as_ref().map_or(true, SymShard::is_empty) {
            if let Some(mini) = self.build_minidebug_symbols(&reader, bias) {
                shard = Some(mini);
            }
        }

        // Find the DWARF data: the module itself, or a separate debug file
        // located by build ID, debuglink or dSYM bundle.
        let debug_file = if reader.has_dwarf() {
            None
        } else {
            self.find_debug_file(path, &reader, &report)
        };

        let dwarf_source = if reader.has_dwarf() {
            Some((path.to_path_buf(), Arc::clone(&file)))
        } else {
            debug_file
                .as_ref()
                .map(|df| (df.path.clone(), Arc::clone(&df.file)))
        };

        let mut index = None;
        if let Some((dwarf_path, dwarf_file)) = &dwarf_source {
            match objfile::Reader::parse(dwarf_file) {
                Ok(dwarf_reader) => {
                    // Separate debug files usually carry the unstripped
                    // symbol table as well.
                    if shard.as_ref().map_or(true, SymShard::is_empty) {
                        if let Some(better) = self.build_symbols(&dwarf_reader, bias) {
                            shard = Some(better);
                        }
                    }

                    match dwarf::SectionStore::load(&dwarf_reader) {
                        Ok(mut store) => {
                            self.attach_sup(dwarf_path, &dwarf_reader, &mut store, &report);

                            if store.has_info() {
                                index = Some(ModuleIndex::new(store, bias, &report));
                            }
                        }
                        Err(e) => {
                            report(
                                &format!(
                                    "cannot load debug sections of {}: {e}",
                                    dwarf_path.display(),
                                ),
                                ERRNUM_MALFORMED,
                            );
                        }
                    }
                }
                Err(e) => {
                    report(
                        &format!("cannot parse debug file {}: {e}", dwarf_path.display()),
                        ERRNUM_MALFORMED,
                    );
                }
            }
        }

        let have_dwarf = index.is_some();

        if let Some(index) = index {
            self.dwarfs.push(
                DwarfModule {
                    path: path.to_path_buf(),
                    index,
                },
                self.threaded,
            );
        }

        if let Some(shard) = shard {
            if !shard.is_empty() {
                debug!(
                    "symtrace: {} symbols from {}",
                    shard.len(),
                    path.display()
                );
                self.symtabs.push(
                    SymModule {
                        path: path.to_path_buf(),
                        shard,
                    },
                    self.threaded,
                );
            }
        }

        if !have_dwarf {
            self.report(
                &format!("no debug info in {}", path.display()),
                ERRNUM_NO_DEBUG_INFO,
            );
        }

        Ok(())
    }

    /// Builds the symbol shard from `.symtab`, falling back to `.dynsym`.
    fn build_symbols(&self, reader: &objfile::Reader<'_>, bias: VirtAddr) -> Option<SymShard> {
        use objfile::SymbolSource::{Debug, Dynamic};

        let source = if reader.has_symbols(Debug) {
            Debug
        } else if reader.has_symbols(Dynamic) {
            Dynamic
        } else {
            return None;
        };

        match SymShard::build(reader, source, bias) {
            Ok(shard) => Some(shard),
            Err(e) => {
                self.report(&format!("cannot read symbol table: {e}"), ERRNUM_MALFORMED);
                None
            }
        }
    }

    /// Decompresses `.gnu_debugdata` and builds a shard from its symbols.
    fn build_minidebug_symbols(
        &self,
        reader: &objfile::Reader<'_>,
        bias: VirtAddr,
    ) -> Option<SymShard> {
        let section = match reader.gnu_debugdata() {
            Ok(section) => section?,
            Err(e) => {
                self.report(
                    &format!("cannot load .gnu_debugdata: {e}"),
                    ERRNUM_MALFORMED,
                );
                return None;
            }
        };

        let bytes = match minidebug::decompress(&section) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.report(&format!("cannot inflate MiniDebugInfo: {e}"), e.errnum());
                return None;
            }
        };

        let mini_file = Arc::new(objfile::File::from_bytes(bytes));
        match objfile::Reader::parse(&mini_file) {
            Ok(mini_reader) => self.build_symbols(&mini_reader, bias),
            Err(e) => {
                self.report(
                    &format!("MiniDebugInfo image does not parse: {e}"),
                    ERRNUM_MALFORMED,
                );
                None
            }
        }
    }

    /// Probes for a separate debug file, in fallback order.
    fn find_debug_file(
        &self,
        path: &Path,
        reader: &objfile::Reader<'_>,
        report: Report<'_>,
    ) -> Option<debugfile::DebugFile> {
        match reader.build_id() {
            Ok(Some(id)) => {
                if let Some(found) = debugfile::open_by_build_id(id) {
                    return Some(found);
                }
            }
            Ok(None) => {}
            Err(e) => report(&format!("cannot read build ID: {e}"), ERRNUM_MALFORMED),
        }

        match reader.debug_link() {
            Ok(Some(link)) => {
                if let Some(found) = debugfile::open_by_debug_link(path, &link, report) {
                    return Some(found);
                }
            }
            Ok(None) => {}
            Err(e) => report(&format!("cannot read debuglink: {e}"), ERRNUM_MALFORMED),
        }

        if reader.format() == objfile::Format::MachO {
            match reader.mach_uuid() {
                Ok(Some(uuid)) => {
                    if let Some(found) = debugfile::open_dsym(path, uuid, report) {
                        return Some(found);
                    }
                }
                Ok(None) => {}
                Err(e) => report(&format!("cannot read image UUID: {e}"), ERRNUM_MALFORMED),
            }
        }

        None
    }

    /// Resolves and attaches the supplementary object file, if any.
    fn attach_sup(
        &self,
        dwarf_path: &Path,
        reader: &objfile::Reader<'_>,
        store: &mut dwarf::SectionStore,
        report: Report<'_>,
    ) {
        let alt = match reader.debug_alt_link() {
            Ok(Some(alt)) => alt,
            Ok(None) => return,
            Err(e) => {
                report(&format!("cannot read debugaltlink: {e}"), ERRNUM_MALFORMED);
                return;
            }
        };

        let Some(found) = debugfile::open_alt_link(dwarf_path, &alt, report) else {
            report(
                &format!(
                    "supplementary debug file for {} not found",
                    dwarf_path.display(),
                ),
                ERRNUM_MALFORMED,
            );
            return;
        };

        match objfile::Reader::parse(&found.file) {
            Ok(alt_reader) => {
                if let Err(e) = store.load_sup(&alt_reader) {
                    report(
                        &format!(
                            "cannot load supplementary sections from {}: {e}",
                            found.path.display(),
                        ),
                        ERRNUM_MALFORMED,
                    );
                }
            }
            Err(e) => {
                report(
                    &format!(
                        "supplementary debug file {} does not parse: {e}",
                        found.path.display(),
                    ),
                    ERRNUM_MALFORMED,
                );
            }
        }
    }

    fn report(&self, msg: &str, errnum: i32) {
        debug!("symtrace: {msg} (errnum {errnum})");

        if let Some(cb) = &self.error_cb {
            cb(msg, errnum);
        }
    }

    fn reporter(&self) -> impl Fn(&str, i32) + '_ {
        move |msg: &str, errnum: i32| self.report(msg, errnum)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("threaded", &self.threaded)
            .field("symtabs", &self.symtabs.iter().count())
            .field("dwarfs", &self.dwarfs.iter().count())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn load_errnum(err: &objfile::Error) -> i32 {
    match err {
        objfile::Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        _ => ERRNUM_MALFORMED,
    }
}

/// Lock-free singly linked list of immutable shards.
///
/// Writers prepend with a release store (CAS when `threaded`), readers
/// traverse from an acquire load of the head. A successful insertion
/// therefore happens-before any read that observes the new head, and
/// published nodes are never modified again.
struct ShardList<T> {
    head: AtomicPtr<Node<T>>,
}

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

impl<T> ShardList<T> {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn push(&self, value: T, threaded: bool) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));

        if threaded {
            let mut head = self.head.load(Ordering::Acquire);
            loop {
                // Safety: the node is not published yet, we still own it.
                unsafe { (*node).next = head };

                match self
                    .head
                    .compare_exchange_weak(head, node, Ordering::Release, Ordering::Acquire)
                {
                    Ok(_) => break,
                    Err(actual) => head = actual,
                }
            }
        } else {
            // Single-threaded callers were promised at creation time; a
            // plain prepend with a release store suffices.
            unsafe { (*node).next = self.head.load(Ordering::Relaxed) };
            self.head.store(node, Ordering::Release);
        }
    }

    fn iter(&self) -> ShardIter<'_, T> {
        ShardIter {
            next: self.head.load(Ordering::Acquire),
            _list: PhantomData,
        }
    }
}

impl<T> Drop for ShardList<T> {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // Safety: exclusive access; every node was created by Box.
            let node = unsafe { Box::from_raw(cur) };
            cur = node.next;
        }
    }
}

// Safety: nodes are immutable after publication and reachable only through
// the atomic head; the list is as thread-safe as the values it stores.
unsafe impl<T: Send> Send for ShardList<T> {}
unsafe impl<T: Send + Sync> Sync for ShardList<T> {}

struct ShardIter<'a, T> {
    next: *mut Node<T>,
    _list: PhantomData<&'a ShardList<T>>,
}

impl<'a, T> Iterator for ShardIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if self.next.is_null() {
            return None;
        }

        // Safety: published nodes live until the list is dropped, which
        // cannot happen while this iterator borrows it.
        let node = unsafe { &*self.next };
        self.next = node.next;
        Some(&node.value)
    }
}

/// A loaded image as reported by the platform's dynamic linker.
struct Image {
    path: PathBuf,
    base: VirtAddr,
}

fn primary_path(primary: Option<&Path>) -> PathBuf {
    match primary {
        Some(path) => path.to_path_buf(),
        None => std::env::current_exe().unwrap_or_else(|_| PathBuf::from("/proc/self/exe")),
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{primary_path, Image, VirtAddr};
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    /// Collects the loaded images by iterating the dynamic linker's phdr
    /// list. The first entry with an empty name is the main program; it is
    /// reported under the primary path. Nameless entries like the vDSO are
    /// skipped, they have no file to read debug info from.
    pub fn discover_images(primary: Option<&Path>) -> Vec<Image> {
        struct CallbackData {
            images: Vec<Image>,
            seen_main: bool,
            primary: PathBuf,
        }

        unsafe extern "C" fn callback(
            info: *mut libc::dl_phdr_info,
            _size: libc::size_t,
            data: *mut libc::c_void,
        ) -> libc::c_int {
            let info = &*info;
            let data = &mut *data.cast::<CallbackData>();

            let named = !info.dlpi_name.is_null() && *info.dlpi_name != 0;
            let path = if named {
                let bytes = CStr::from_ptr(info.dlpi_name).to_bytes();
                PathBuf::from(OsStr::from_bytes(bytes))
            } else if !data.seen_main {
                data.seen_main = true;
                data.primary.clone()
            } else {
                // vDSO and other anonymous pseudo-modules.
                return 0;
            };

            if path.is_absolute() || !named {
                data.images.push(Image {
                    path,
                    base: info.dlpi_addr as VirtAddr,
                });
            }

            0
        }

        let mut data = CallbackData {
            images: Vec::new(),
            seen_main: false,
            primary: primary_path(primary),
        };

        unsafe {
            libc::dl_iterate_phdr(Some(callback), (&mut data as *mut CallbackData).cast());
        }

        data.images
    }
}

#[cfg(target_os = "macos")]
mod platform {
    use super::{Image, VirtAddr};
    use std::ffi::{CStr, OsStr};
    use std::os::unix::ffi::OsStrExt;
    use std::path::{Path, PathBuf};

    /// Collects the loaded images from the dyld image list. The recorded
    /// slide is the ASLR displacement of each image. An explicit primary
    /// path is matched against the image list by canonical path so that the
    /// caller-provided spelling wins; an unmatched primary is registered
    /// without a slide.
    pub fn discover_images(primary: Option<&Path>) -> Vec<Image> {
        let mut images = Vec::new();

        let count = unsafe { libc::_dyld_image_count() };
        for i in 0..count {
            let name = unsafe { libc::_dyld_get_image_name(i) };
            if name.is_null() {
                continue;
            }

            let bytes = unsafe { CStr::from_ptr(name) }.to_bytes();
            let slide = unsafe { libc::_dyld_get_image_vmaddr_slide(i) };

            images.push(Image {
                path: PathBuf::from(OsStr::from_bytes(bytes)),
                base: slide as VirtAddr,
            });
        }

        if let Some(primary) = primary {
            let canon = std::fs::canonicalize(primary).unwrap_or_else(|_| primary.to_path_buf());
            let known = images.iter().any(|img| {
                std::fs::canonicalize(&img.path).map_or(false, |p| p == canon)
            });

            if !known {
                images.push(Image {
                    path: primary.to_path_buf(),
                    base: 0,
                });
            }
        }

        images
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod platform {
    use super::{primary_path, Image};
    use std::path::Path;

    /// Without a dynamic-linker enumeration API only the main executable is
    /// registered, at bias zero.
    pub fn discover_images(primary: Option<&Path>) -> Vec<Image> {
        vec![Image {
            path: primary_path(primary),
            base: 0,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gimli::write as gw;
    use object::write as ow;
    use std::sync::atomic::AtomicUsize;

    const BIAS: VirtAddr = 0x40_0000;

    /// Collects error-callback reports for assertions.
    fn recording_callback() -> (ErrorCallback, Arc<Mutex<Vec<(String, i32)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let cb: ErrorCallback = Box::new(move |msg: &str, errnum: i32| {
            sink.lock().unwrap().push((msg.to_owned(), errnum));
        });
        (cb, log)
    }

    /// Writes an ELF with a symbol table and, optionally, extra raw
    /// sections (DWARF bytes, debuglink, MiniDebugInfo).
    fn write_elf(
        path: &Path,
        symbols: &[(&[u8], u64, u64)],
        sections: &[(&[u8], Vec<u8>)],
    ) {
        let mut obj = ow::Object::new(
            object::BinaryFormat::Elf,
            object::Architecture::X86_64,
            object::Endianness::Little,
        );

        let text = obj.add_section(vec![], b".text".to_vec(), object::SectionKind::Text);
        obj.section_mut(text).set_data(vec![0x90u8; 0x40], 16);

        for &(name, value, size) in symbols {
            obj.add_symbol(ow::Symbol {
                name: name.to_vec(),
                value,
                size,
                kind: object::SymbolKind::Text,
                scope: object::SymbolScope::Linkage,
                weak: false,
                section: ow::SymbolSection::Section(text),
                flags: object::SymbolFlags::None,
            });
        }

        for (name, data) in sections {
            let id = obj.add_section(vec![], name.to_vec(), object::SectionKind::Metadata);
            obj.section_mut(id).set_data(data.clone(), 4);
        }

        fs::write(path, obj.write().unwrap()).unwrap();
    }

    fn collect_frames(state: &State, pc: VirtAddr) -> (bool, Vec<(Option<String>, Option<String>, u32)>) {
        let mut frames = Vec::new();
        let delivered = state
            .pc_full(pc, &mut |frame: &Frame<'_>| {
                frames.push((
                    frame.function.map(str::to_owned),
                    frame.file.map(str::to_owned),
                    frame.line,
                ));
                Ok(())
            })
            .unwrap();
        (delivered, frames)
    }

    #[test]
    fn shard_list_push_iter() {
        let list: ShardList<u32> = ShardList::new();
        list.push(1, false);
        list.push(2, false);
        list.push(3, true);

        // Most recently published first.
        let items: Vec<u32> = list.iter().copied().collect();
        assert_eq!(items, [3, 2, 1]);
    }

    #[test]
    fn shard_list_concurrent_push() {
        let list: ShardList<usize> = ShardList::new();
        let counter = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..250 {
                        let value = counter.fetch_add(1, Ordering::Relaxed);
                        list.push(value, true);
                    }
                });
            }
        });

        let mut items: Vec<usize> = list.iter().copied().collect();
        items.sort_unstable();
        assert_eq!(items, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn symbols_from_registered_module() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        write_elf(&path, &[(b"alpha", 0x10, 0x10), (b"beta", 0x20, 0x20)], &[]);

        let state = State::empty(true, None);
        state.register_module(&path, BIAS).unwrap();

        let hit = state.pc_symbol(BIAS + 0x18).unwrap();
        assert_eq!(hit.name, "alpha");
        assert_eq!(hit.address, BIAS + 0x10);
        assert_eq!(hit.size, 0x10);

        assert!(state.pc_symbol(BIAS + 0x80).is_none());

        // Registering the same module twice is a no-op.
        state.register_module(&path, BIAS).unwrap();
        assert_eq!(state.symtabs.iter().count(), 1);
    }

    #[test]
    fn frames_from_module_with_dwarf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        write_elf(&path, &[], &dwarf_sections_for_inline_unit());

        let state = State::empty(true, None);
        state.register_module(&path, BIAS).unwrap();

        // PC inside the inlined body: innermost first, then the caller.
        let (delivered, frames) = collect_frames(&state, BIAS + 0x1048);
        assert!(delivered);
        assert_eq!(
            frames,
            [
                (
                    Some("inner".to_owned()),
                    Some("/src/outer.c".to_owned()),
                    12,
                ),
                (
                    Some("outer".to_owned()),
                    Some("/src/outer.c".to_owned()),
                    7,
                ),
            ],
        );

        // PC outside any coverage: one empty frame, not delivered.
        let (delivered, frames) = collect_frames(&state, BIAS + 0x9000);
        assert!(!delivered);
        assert_eq!(frames, [(None, None, 0)]);
    }

    #[test]
    fn debuglink_separate_debug_file() {
        let dir = tempfile::tempdir().unwrap();
        let debug_path = dir.path().join("app.debug");
        write_elf(&debug_path, &[], &dwarf_sections_for_inline_unit());
        let debug_bytes = fs::read(&debug_path).unwrap();

        // Stripped primary: symbols only, plus the debuglink.
        let (cb, log) = recording_callback();
        let primary = dir.path().join("app");
        write_elf(
            &primary,
            &[(b"outer", 0x1000, 0x100)],
            &[(
                b".gnu_debuglink",
                debuglink_section(b"app.debug", crc32fast::hash(&debug_bytes)),
            )],
        );

        let state = State::empty(true, Some(cb));
        state.register_module(&primary, BIAS).unwrap();

        let (delivered, frames) = collect_frames(&state, BIAS + 0x1048);
        assert!(delivered, "reports: {:?}", log.lock().unwrap());
        assert_eq!(frames[0].0.as_deref(), Some("inner"));
        assert_eq!(frames[1].0.as_deref(), Some("outer"));
    }

    #[test]
    fn debuglink_crc_mismatch_is_never_used() {
        let dir = tempfile::tempdir().unwrap();
        let debug_path = dir.path().join("app.debug");
        write_elf(&debug_path, &[], &dwarf_sections_for_inline_unit());
        let debug_bytes = fs::read(&debug_path).unwrap();

        let (cb, log) = recording_callback();
        let primary = dir.path().join("app");
        write_elf(
            &primary,
            &[(b"outer", 0x1000, 0x100)],
            &[(
                b".gnu_debuglink",
                // One flipped bit in the recorded CRC.
                debuglink_section(b"app.debug", crc32fast::hash(&debug_bytes) ^ 1),
            )],
        );

        let state = State::empty(true, Some(cb));
        state.register_module(&primary, BIAS).unwrap();

        // No frames with debug info...
        let (delivered, _) = collect_frames(&state, BIAS + 0x1048);
        assert!(!delivered);

        // ...but the symbol table still answers.
        assert_eq!(state.pc_symbol(BIAS + 0x1048).unwrap().name, "outer");

        // Both the CRC mismatch and the missing-debug-info report arrived.
        let log = log.lock().unwrap();
        assert!(log.iter().any(|(msg, errnum)| {
            *errnum == ERRNUM_MALFORMED && msg.contains("CRC")
        }));
        assert!(log
            .iter()
            .any(|(_, errnum)| *errnum == ERRNUM_NO_DEBUG_INFO));
    }

    #[test]
    fn minidebug_symbols() {
        let dir = tempfile::tempdir().unwrap();

        // Inner ELF with the symbol table, as distros package it.
        let inner_path = dir.path().join("inner.elf");
        write_elf(&inner_path, &[(b"foo", 0x1100, 0x40)], &[]);
        let inner_bytes = fs::read(&inner_path).unwrap();

        let mut stream =
            xz2::stream::Stream::new_easy_encoder(6, xz2::stream::Check::Crc32).unwrap();
        let mut packed = Vec::with_capacity(inner_bytes.len());
        loop {
            let consumed = stream.total_in() as usize;
            let status = stream
                .process_vec(
                    &inner_bytes[consumed..],
                    &mut packed,
                    xz2::stream::Action::Finish,
                )
                .unwrap();
            if status == xz2::stream::Status::StreamEnd {
                break;
            }
            packed.reserve(4096);
        }

        // Outer ELF is fully stripped: only `.gnu_debugdata` remains.
        let primary = dir.path().join("app");
        write_elf(&primary, &[], &[(b".gnu_debugdata", packed)]);

        let state = State::empty(true, None);
        state.register_module(&primary, BIAS).unwrap();

        let hit = state.pc_symbol(BIAS + 0x1120).unwrap();
        assert_eq!(hit.name, "foo");

        // No DWARF anywhere: pc_full yields the symbol name, undelivered.
        let (delivered, frames) = collect_frames(&state, BIAS + 0x1120);
        assert!(!delivered);
        assert_eq!(frames, [(Some("foo".to_owned()), None, 0)]);
    }

    #[test]
    fn pc_print_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        write_elf(&path, &[], &dwarf_sections_for_inline_unit());

        let state = State::empty(true, None);
        state.register_module(&path, BIAS).unwrap();

        let mut out = Vec::new();
        state.pc_print(BIAS + 0x1048, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            format!("{:#x} inner at /src/outer.c:12", BIAS + 0x1048),
        );
        assert_eq!(
            lines.next().unwrap(),
            format!("{:#x} outer at /src/outer.c:7", BIAS + 0x1048),
        );
        assert!(lines.next().is_none());

        let mut out = Vec::new();
        state.pc_print(BIAS + 0x9000, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            format!("{:#x} ??\n", BIAS + 0x9000),
        );
    }

    #[test]
    fn concurrent_queries_match_serial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        write_elf(
            &path,
            &[(b"outer", 0x1000, 0x100)],
            &dwarf_sections_for_inline_unit(),
        );

        let state = State::empty(true, None);
        state.register_module(&path, BIAS).unwrap();

        let serial: Vec<_> = (0..0x110u64)
            .map(|off| collect_frames(&state, BIAS + 0x1000 + off))
            .collect();

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for (off, expected) in serial.iter().enumerate() {
                        let got = collect_frames(&state, BIAS + 0x1000 + off as u64);
                        assert_eq!(&got, expected);
                    }
                });
            }
        });
    }

    /// Serializes the inline test unit into raw `(name, bytes)` sections
    /// ready to be embedded in an ELF.
    fn dwarf_sections_for_inline_unit() -> Vec<(&'static [u8], Vec<u8>)> {
        let encoding = gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 8,
        };

        let mut dwarf = gw::DwarfUnit::new(encoding);

        let mut line_program = gw::LineProgram::new(
            encoding,
            gimli::LineEncoding::default(),
            gw::LineString::String(b"/src".to_vec()),
            gw::LineString::String(b"outer.c".to_vec()),
            None,
        );
        let dir_id = line_program.default_directory();
        let file_id = line_program.add_file(
            gw::LineString::String(b"outer.c".to_vec()),
            dir_id,
            None,
        );

        line_program.begin_sequence(Some(gw::Address::Constant(0x1000)));
        for &(offset, line) in &[(0x00u64, 10u64), (0x10, 11), (0x40, 12), (0x60, 13)] {
            line_program.row().address_offset = offset;
            line_program.row().file = file_id;
            line_program.row().line = line;
            line_program.generate_row();
        }
        line_program.end_sequence(0x100);
        dwarf.unit.line_program = line_program;

        let root_id = dwarf.unit.root();
        let root = dwarf.unit.get_mut(root_id);
        root.set(
            gimli::DW_AT_name,
            gw::AttributeValue::String(b"outer.c".to_vec()),
        );
        root.set(
            gimli::DW_AT_comp_dir,
            gw::AttributeValue::String(b"/src".to_vec()),
        );
        root.set(
            gimli::DW_AT_low_pc,
            gw::AttributeValue::Address(gw::Address::Constant(0x1000)),
        );
        root.set(gimli::DW_AT_high_pc, gw::AttributeValue::Udata(0x100));

        let sub_id = dwarf.unit.add(root_id, gimli::DW_TAG_subprogram);
        let sub = dwarf.unit.get_mut(sub_id);
        sub.set(
            gimli::DW_AT_name,
            gw::AttributeValue::String(b"outer".to_vec()),
        );
        sub.set(
            gimli::DW_AT_low_pc,
            gw::AttributeValue::Address(gw::Address::Constant(0x1000)),
        );
        sub.set(gimli::DW_AT_high_pc, gw::AttributeValue::Udata(0x100));

        let inl_id = dwarf.unit.add(sub_id, gimli::DW_TAG_inlined_subroutine);
        let inl = dwarf.unit.get_mut(inl_id);
        inl.set(
            gimli::DW_AT_name,
            gw::AttributeValue::String(b"inner".to_vec()),
        );
        inl.set(
            gimli::DW_AT_low_pc,
            gw::AttributeValue::Address(gw::Address::Constant(0x1040)),
        );
        inl.set(gimli::DW_AT_high_pc, gw::AttributeValue::Udata(0x20));
        inl.set(
            gimli::DW_AT_call_file,
            gw::AttributeValue::FileIndex(Some(file_id)),
        );
        inl.set(gimli::DW_AT_call_line, gw::AttributeValue::Udata(7));
        inl.set(gimli::DW_AT_call_column, gw::AttributeValue::Udata(3));

        let mut sections = gw::Sections::new(gw::EndianVec::new(gimli::LittleEndian));
        dwarf.write(&mut sections).unwrap();

        let mut raw: Vec<(&'static [u8], Vec<u8>)> = Vec::new();
        sections
            .for_each(|id, data| {
                if !data.slice().is_empty() {
                    raw.push((id.name().as_bytes(), data.slice().to_vec()));
                }
                Ok::<(), gimli::Error>(())
            })
            .unwrap();

        raw
    }

    /// Raw contents of a `.gnu_debuglink` section.
    fn debuglink_section(name: &[u8], crc: u32) -> Vec<u8> {
        let mut data = name.to_vec();
        data.push(0);
        while data.len() % 4 != 0 {
            data.push(0);
        }
        data.extend_from_slice(&crc.to_le_bytes());
        data
    }
}
