//! Dynamic symbol table walk
//!
//! Finds exported definitions by reading every loaded module's dynamic
//! section through `dl_iterate_phdr`, without calling `dlsym`. This is how the
//! loader's own entry points are located before `dlsym` itself is interposed.

use crate::hook::entry::FnAddr;

use std::ffi::{c_char, c_int, c_void, CStr};
use std::mem::size_of;

const DT_NULL: isize = 0;
const DT_HASH: isize = 4;
const DT_STRTAB: isize = 5;
const DT_SYMTAB: isize = 6;
const DT_GNU_HASH: isize = 0x6fff_fef5;

const VDSO_NAMES: &[&str] = &["linux-vdso.so.1", "linux-gate.so.1", "linux-vdso64.so.1"];

#[repr(C)]
struct ElfDyn {
    d_tag: isize,
    d_val: usize,
}

#[cfg(target_pointer_width = "64")]
#[allow(dead_code)]
#[repr(C)]
struct ElfSym {
    st_name: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
    st_value: u64,
    st_size: u64,
}

#[cfg(target_pointer_width = "32")]
#[allow(dead_code)]
#[repr(C)]
struct ElfSym {
    st_name: u32,
    st_value: u32,
    st_size: u32,
    st_info: u8,
    st_other: u8,
    st_shndx: u16,
}

struct Search<'a> {
    names: &'a [&'a str],
    found: Vec<Option<FnAddr>>,
    skip_base: Option<usize>,
}

/// Look up the first definition of each name across all loaded modules
///
/// Modules are visited in load order; the main executable and the vDSO are
/// skipped, as is the module loaded at `skip_base` (the caller's own
/// library, whose exports would otherwise shadow the real ones).
pub fn find_symbols(names: &[&str], skip_base: Option<usize>) -> Vec<Option<FnAddr>> {
    let mut search = Search {
        names,
        found: vec![None; names.len()],
        skip_base,
    };
    // SAFETY: the callback only reads loader-owned data for the duration of
    // the call and writes into `search`, which outlives it.
    unsafe {
        libc::dl_iterate_phdr(Some(visit_module), &mut search as *mut Search as *mut c_void);
    }
    search.found
}

/// Base address of the module containing `addr`
pub fn module_base(addr: *const c_void) -> Option<usize> {
    // SAFETY: dladdr only writes into `info`.
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(addr, &mut info) } == 0 {
        return None;
    }
    Some(info.dli_fbase as usize)
}

unsafe extern "C" fn visit_module(
    info: *mut libc::dl_phdr_info,
    _size: usize,
    data: *mut c_void,
) -> c_int {
    let info = &*info;
    let search = &mut *(data as *mut Search);

    let name = if info.dlpi_name.is_null() {
        ""
    } else {
        CStr::from_ptr(info.dlpi_name).to_str().unwrap_or("")
    };
    let basename = name.rsplit('/').next().unwrap_or(name);
    if basename.is_empty() || VDSO_NAMES.contains(&basename) {
        return 0;
    }
    let base = info.dlpi_addr as usize;
    if search.skip_base == Some(base) {
        return 0;
    }

    log::trace!("retrieve from {} base {:#x}", name, base);
    let phdrs = std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    for phdr in phdrs.iter().filter(|p| p.p_type == libc::PT_DYNAMIC) {
        let dynamic = (base + phdr.p_vaddr as usize) as *const ElfDyn;
        scan_dynamic(dynamic, base, search);
    }

    // Keep iterating until every name has a definition.
    c_int::from(search.found.iter().all(Option::is_some))
}

unsafe fn scan_dynamic(mut dynamic: *const ElfDyn, base: usize, search: &mut Search) {
    let relocate = |ptr: usize| if ptr < base { ptr + base } else { ptr };

    let mut hash = None;
    let mut gnu_hash = None;
    let mut strtab = None;
    let mut symtab = None;

    while (*dynamic).d_tag != DT_NULL {
        let value = (*dynamic).d_val;
        match (*dynamic).d_tag {
            DT_HASH => hash = Some(relocate(value) as *const u32),
            DT_GNU_HASH => gnu_hash = Some(relocate(value) as *const u32),
            DT_STRTAB => strtab = Some(relocate(value) as *const c_char),
            DT_SYMTAB => symtab = Some(relocate(value) as *const ElfSym),
            _ => {}
        }
        dynamic = dynamic.add(1);
    }

    let (Some(strtab), Some(symtab)) = (strtab, symtab) else {
        return;
    };
    let count = match (hash, gnu_hash) {
        // The second word of the SysV hash table is the symbol count.
        (Some(hash), _) => *hash.add(1) as usize,
        (None, Some(gnu)) => gnu_hash_symbol_count(gnu),
        (None, None) => return,
    };

    for sym in std::slice::from_raw_parts(symtab, count) {
        // Undefined (imported) symbols have no value.
        if sym.st_value == 0 {
            continue;
        }
        let sym_name = CStr::from_ptr(strtab.add(sym.st_name as usize)).to_bytes();
        let Some(slot) = search.names.iter().position(|n| n.as_bytes() == sym_name) else {
            continue;
        };
        if search.found[slot].is_none() {
            search.found[slot] = FnAddr::new((base + sym.st_value as usize) as *const c_void);
        }
    }
}

/// Symbol count of a GNU hash section
///
/// The table does not store the count. It is one past the highest symbol
/// index reachable from any bucket, found by following that bucket's chain
/// to its terminator (low bit set).
unsafe fn gnu_hash_symbol_count(table: *const u32) -> usize {
    let nbuckets = *table as usize;
    let symoffset = *table.add(1) as usize;
    let bloom_size = *table.add(2) as usize;

    let bloom = table.add(4) as *const usize;
    let buckets = bloom.add(bloom_size) as *const u32;
    let chain = buckets.add(nbuckets);

    let last = std::slice::from_raw_parts(buckets, nbuckets)
        .iter()
        .copied()
        .max()
        .unwrap_or(0) as usize;
    if last < symoffset {
        return symoffset;
    }

    let mut idx = last;
    while *chain.add(idx - symoffset) & 1 == 0 {
        idx += 1;
    }
    idx + 1
}

const _: () = assert!(size_of::<ElfDyn>() == 2 * size_of::<usize>());

#[cfg(test)]
mod tests {
    use super::*;

    type DlsymFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;

    #[test]
    fn test_finds_loader_symbols() {
        let found = find_symbols(&["dlopen", "dlsym", "dlclose", "dladdr", "ioctl"], None);
        assert!(found.iter().all(Option::is_some), "{:?}", found);
    }

    #[test]
    fn test_found_dlsym_is_callable() {
        let found = find_symbols(&["dlsym"], None);
        let dlsym: DlsymFn = unsafe { std::mem::transmute(found[0].unwrap().as_ptr()) };
        let getpid = unsafe { dlsym(libc::RTLD_DEFAULT, c"getpid".as_ptr()) };
        assert!(!getpid.is_null());
    }

    #[test]
    fn test_missing_symbol_is_none() {
        let found = find_symbols(&["cudagov_no_such_symbol"], None);
        assert!(found[0].is_none());
    }

    #[test]
    fn test_gnu_hash_count() {
        // nbuckets 2, symoffset 3, bloom 1 word, shift 0; buckets [3, 5];
        // chain for symbols 3..=6, terminator on symbol 6.
        let mut table: Vec<u32> = vec![2, 3, 1, 0];
        table.extend(std::iter::repeat(0).take(size_of::<usize>() / 4));
        table.extend([3, 5]);
        table.extend([0, 0, 0, 1]);
        assert_eq!(unsafe { gnu_hash_symbol_count(table.as_ptr()) }, 7);
    }

    #[test]
    fn test_gnu_hash_empty_buckets() {
        let mut table: Vec<u32> = vec![1, 4, 1, 0];
        table.extend(std::iter::repeat(0).take(size_of::<usize>() / 4));
        table.push(0);
        assert_eq!(unsafe { gnu_hash_symbol_count(table.as_ptr()) }, 4);
    }
}
