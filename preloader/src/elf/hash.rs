//! Dynamic-symbol lookup in a loaded image.
//!
//! Both hash flavors are supported; the GNU table wins when an image carries
//! both. The Bloom filter of the GNU format is not consulted: the loader
//! performs exactly one lookup, so the chain walk is already cheap.

use super::mapper::LinkMap;
use super::{ElfDyn, ElfSym, DT_GNU_HASH, DT_HASH, DT_NULL, DT_STRSZ, DT_STRTAB, DT_SYMTAB,
            PT_DYNAMIC, STB_GLOBAL};

/// Classical SysV hash: 4-bit shift-and-xor.
pub fn elf_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &c in name {
        hash = (hash << 4).wrapping_add(c as u32);
        let hi = hash & 0xf000_0000;
        hash ^= hi;
        hash ^= hi >> 24;
    }
    hash
}

/// GNU hash: DJB with seed 5381 and multiplier 33.
pub fn gnu_hash(name: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &c in name {
        hash = hash.wrapping_mul(33).wrapping_add(c as u32);
    }
    hash
}

struct DynamicTables {
    strings: *const u8,
    strsz: usize,
    symtab: *const ElfSym,
    hashtab: *const u32,
    gnu_hashtab: *const u32,
}

/// # Safety
/// `dynamic` must point to a DT_NULL-terminated dynamic section whose table
/// addresses (biased by `l_addr`) are mapped.
unsafe fn collect_tables(dynamic: *const ElfDyn, l_addr: usize) -> DynamicTables {
    let mut tables = DynamicTables {
        strings: core::ptr::null(),
        strsz: 0,
        symtab: core::ptr::null(),
        hashtab: core::ptr::null(),
        gnu_hashtab: core::ptr::null(),
    };
    let mut i = 0;
    loop {
        // SAFETY: termination guaranteed by the caller.
        let entry = unsafe { dynamic.add(i).read() };
        match entry.d_tag {
            DT_NULL => break,
            DT_STRTAB => tables.strings = l_addr.wrapping_add(entry.d_val) as *const u8,
            DT_STRSZ => tables.strsz = entry.d_val,
            DT_SYMTAB => tables.symtab = l_addr.wrapping_add(entry.d_val) as *const ElfSym,
            DT_HASH => tables.hashtab = l_addr.wrapping_add(entry.d_val) as *const u32,
            DT_GNU_HASH => tables.gnu_hashtab = l_addr.wrapping_add(entry.d_val) as *const u32,
            _ => {}
        }
        i += 1;
    }
    tables
}

/// Does symbol `idx` name `wanted` within the string table bounds?
///
/// # Safety
/// `idx` must be a valid symbol-table index.
unsafe fn symbol_matches(t: &DynamicTables, idx: usize, wanted: &[u8], sym_type: u8) -> bool {
    // SAFETY: index validity guaranteed by the caller.
    let sym = unsafe { t.symtab.add(idx).read() };
    if sym.st_bind() != STB_GLOBAL || sym.st_type() != sym_type {
        return false;
    }
    let name_off = sym.st_name as usize;
    // When the image declares its string-table size, refuse to read past it.
    if t.strsz != 0 && name_off + wanted.len() + 1 > t.strsz {
        return false;
    }
    // SAFETY: the name lies inside the mapped string table.
    let name = unsafe { core::slice::from_raw_parts(t.strings.add(name_off), wanted.len() + 1) };
    &name[..wanted.len()] == wanted && name[wanted.len()] == 0
}

/// Address of the GLOBAL symbol `name` of type `sym_type` in `map`, or None.
///
/// # Safety
/// `map` must describe a fully mapped image.
pub unsafe fn find_symbol(map: &LinkMap, name: &[u8], sym_type: u8) -> Option<usize> {
    // SAFETY: the program headers were mapped along with the image.
    let phdrs = unsafe { core::slice::from_raw_parts(map.l_phdr, map.l_phnum) };
    let dynamic = phdrs
        .iter()
        .find(|ph| ph.p_type == PT_DYNAMIC)
        .map(|ph| map.l_addr.wrapping_add(ph.p_vaddr) as *const ElfDyn)?;

    // SAFETY: PT_DYNAMIC names a mapped, terminated dynamic section.
    let tables = unsafe { collect_tables(dynamic, map.l_addr) };
    if tables.strings.is_null() || tables.symtab.is_null() {
        return None;
    }

    let idx = if !tables.gnu_hashtab.is_null() {
        // SAFETY: the GNU hash table is mapped image data.
        unsafe { gnu_lookup(&tables, name, sym_type) }
    } else if !tables.hashtab.is_null() {
        // SAFETY: the SysV hash table is mapped image data.
        unsafe { sysv_lookup(&tables, name, sym_type) }
    } else {
        None
    }?;

    // SAFETY: `idx` came from a hash chain and was matched above.
    let sym = unsafe { tables.symtab.add(idx).read() };
    Some(map.l_addr.wrapping_add(sym.st_value))
}

/// # Safety
/// `t.gnu_hashtab` must point to a well-formed GNU hash table.
unsafe fn gnu_lookup(t: &DynamicTables, name: &[u8], sym_type: u8) -> Option<usize> {
    let table = t.gnu_hashtab;
    // SAFETY: the four header words are always present.
    let (nbuckets, symbias, nwords) = unsafe {
        (
            table.read() as usize,
            table.add(1).read() as usize,
            table.add(2).read() as usize,
        )
    };
    if nbuckets == 0 {
        return None;
    }
    // The Bloom words are skipped, not read.
    // SAFETY: offsets follow the GNU hash layout.
    let buckets = unsafe { (table.add(4) as *const usize).add(nwords) as *const u32 };
    // SAFETY: chains follow the buckets.
    let chains = unsafe { buckets.add(nbuckets) };

    let hash = gnu_hash(name);
    // SAFETY: bucket index is reduced modulo nbuckets.
    let mut idx = unsafe { buckets.add(hash as usize % nbuckets).read() } as usize;
    if idx < symbias {
        return None;
    }
    loop {
        // SAFETY: chain entries exist for every index from symbias up to the
        // chain's terminator.
        let chained = unsafe { chains.add(idx - symbias).read() };
        if (chained ^ hash) & !1 == 0
            // SAFETY: idx walks the image's own symbol table.
            && unsafe { symbol_matches(t, idx, name, sym_type) }
        {
            return Some(idx);
        }
        if chained & 1 != 0 {
            return None;
        }
        idx += 1;
    }
}

/// # Safety
/// `t.hashtab` must point to a well-formed SysV hash table.
unsafe fn sysv_lookup(t: &DynamicTables, name: &[u8], sym_type: u8) -> Option<usize> {
    let table = t.hashtab;
    // SAFETY: the two header words are always present.
    let nbuckets = unsafe { table.read() } as usize;
    if nbuckets == 0 {
        return None;
    }
    // SAFETY: buckets follow the two header words, chains follow buckets.
    let buckets = unsafe { table.add(2) };
    let chains = unsafe { buckets.add(nbuckets) };

    let hash = elf_hash(name);
    // SAFETY: bucket index is reduced modulo nbuckets.
    let mut idx = unsafe { buckets.add(hash as usize % nbuckets).read() } as usize;
    while idx != 0 {
        // SAFETY: idx walks the image's own symbol table and chain array.
        if unsafe { symbol_matches(t, idx, name, sym_type) } {
            return Some(idx);
        }
        // SAFETY: as above.
        idx = unsafe { chains.add(idx).read() } as usize;
    }
    None
}
