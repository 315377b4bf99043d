//! Writer for the rite compiled-unit format, symmetric with the loader.

use crate::irep::{DebugLines, Irep, PoolValue};
use crate::loader::{
    BINARY_HEADER_SIZE, RITE_BINARY_IDENT, RITE_BINARY_IDENT_LIL, RITE_BINARY_VERSION,
    RITE_COMPILER_NAME, RITE_COMPILER_VERSION, RITE_SYM_NONE, SECTION_DBG_IDENT,
    SECTION_EOF_IDENT, SECTION_IREP_IDENT, SECTION_LVAR_IDENT,
};
use crate::symbol::Sym;
use crate::vm::Vm;
use rite_io::{crc16_ccitt, BinaryWriter, Endian};

/// Serializes an irep tree to rite bytes. Local-variable and debug
/// sections are emitted only when the tree carries that information.
pub fn dump_rite(vm: &Vm, irep: &Irep, endian: Endian) -> Vec<u8> {
    let mut w = BinaryWriter::with_capacity(256, endian);
    w.write_ident(match endian {
        Endian::Big => RITE_BINARY_IDENT,
        Endian::Little => RITE_BINARY_IDENT_LIL,
    });
    w.write_ident(RITE_BINARY_VERSION);
    w.write_ident(RITE_COMPILER_NAME);
    w.write_ident(RITE_COMPILER_VERSION);
    let size_pos = w.position();
    w.write_u32(0);
    let crc_pos = w.position();
    w.write_u16(0);
    debug_assert_eq!(w.position(), BINARY_HEADER_SIZE);

    // IREP section
    let sec_start = w.position();
    w.write_ident(SECTION_IREP_IDENT);
    let sec_size_pos = w.position();
    w.write_u32(0);
    write_irep_record(vm, &mut w, irep);
    let sec_len = w.position() - sec_start;
    w.patch_u32(sec_size_pos, sec_len as u32);

    // LVAR section
    if has_lvars(irep) {
        let sec_start = w.position();
        w.write_ident(SECTION_LVAR_IDENT);
        let sec_size_pos = w.position();
        w.write_u32(0);
        let mut table: Vec<Sym> = Vec::new();
        collect_lvar_syms(irep, &mut table);
        w.write_u32(table.len() as u32);
        for &sym in &table {
            let name = vm.symbols.name(sym);
            w.write_u16(name.len() as u16);
            w.write_bytes(name.as_bytes());
        }
        write_lvar_record(&mut w, irep, &table);
        let sec_len = w.position() - sec_start;
        w.patch_u32(sec_size_pos, sec_len as u32);
    }

    // DBG section
    if has_debug(irep) {
        let sec_start = w.position();
        w.write_ident(SECTION_DBG_IDENT);
        let sec_size_pos = w.position();
        w.write_u32(0);
        let mut filenames: Vec<String> = Vec::new();
        collect_filenames(irep, &mut filenames);
        w.write_u16(filenames.len() as u16);
        for name in &filenames {
            w.write_u16(name.len() as u16);
            w.write_bytes(name.as_bytes());
        }
        write_debug_record(&mut w, irep, &filenames);
        let sec_len = w.position() - sec_start;
        w.patch_u32(sec_size_pos, sec_len as u32);
    }

    // footer
    w.write_ident(SECTION_EOF_IDENT);
    w.write_u32(8);

    let total = w.position();
    w.patch_u32(size_pos, total as u32);
    let crc = crc16_ccitt(&w.as_bytes()[crc_pos + 2..], 0);
    w.patch_u16(crc_pos, crc);
    w.into_bytes()
}

fn write_irep_record(vm: &Vm, w: &mut BinaryWriter, irep: &Irep) {
    let record_start = w.position();
    let record_size_pos = w.position();
    w.write_u32(0);
    w.write_u16(irep.nlocals);
    w.write_u16(irep.nregs);
    w.write_u16(irep.reps.len() as u16);

    w.write_u32(irep.iseq.len() as u32);
    w.align(4);
    w.write_bytes(&irep.iseq);

    w.write_u32(irep.pool.len() as u32);
    for entry in &irep.pool {
        match entry {
            PoolValue::Str(s) => {
                w.write_u8(0);
                w.write_u16(s.len() as u16);
                w.write_bytes(s.as_bytes());
            }
            PoolValue::Fixnum(i) => {
                let text = i.to_string();
                w.write_u8(1);
                w.write_u16(text.len() as u16);
                w.write_bytes(text.as_bytes());
            }
            PoolValue::Float(f) => {
                let text = f.to_string();
                w.write_u8(2);
                w.write_u16(text.len() as u16);
                w.write_bytes(text.as_bytes());
            }
        }
    }

    w.write_u32(irep.syms.len() as u32);
    for &sym in &irep.syms {
        let name = vm.symbols.name(sym);
        if name.is_empty() {
            w.write_u16(RITE_SYM_NONE);
            continue;
        }
        w.write_u16(name.len() as u16);
        w.write_bytes(name.as_bytes());
        w.write_u8(0);
    }

    for child in &irep.reps {
        write_irep_record(vm, w, child);
    }
    let record_len = w.position() - record_start;
    w.patch_u32(record_size_pos, record_len as u32);
}

fn has_lvars(irep: &Irep) -> bool {
    !irep.lvars.is_empty() || irep.reps.iter().any(|c| has_lvars(c))
}

fn has_debug(irep: &Irep) -> bool {
    !irep.debug.is_empty() || irep.reps.iter().any(|c| has_debug(c))
}

fn collect_lvar_syms(irep: &Irep, table: &mut Vec<Sym>) {
    for lv in &irep.lvars {
        if let Some(sym) = lv.name {
            if !table.contains(&sym) {
                table.push(sym);
            }
        }
    }
    for child in &irep.reps {
        collect_lvar_syms(child, table);
    }
}

fn write_lvar_record(w: &mut BinaryWriter, irep: &Irep, table: &[Sym]) {
    let n = irep.nlocals.saturating_sub(1) as usize;
    for i in 0..n {
        match irep.lvars.get(i) {
            Some(lv) => {
                match lv.name.and_then(|s| table.iter().position(|&t| t == s)) {
                    Some(idx) => w.write_u16(idx as u16),
                    None => w.write_u16(RITE_SYM_NONE),
                }
                w.write_u16(lv.reg);
            }
            None => {
                w.write_u16(RITE_SYM_NONE);
                w.write_u16(0);
            }
        }
    }
    for child in &irep.reps {
        write_lvar_record(w, child, table);
    }
}

fn collect_filenames(irep: &Irep, names: &mut Vec<String>) {
    for f in &irep.debug {
        if !names.contains(&f.filename) {
            names.push(f.filename.clone());
        }
    }
    for child in &irep.reps {
        collect_filenames(child, names);
    }
}

fn write_debug_record(w: &mut BinaryWriter, irep: &Irep, filenames: &[String]) {
    let start = w.position();
    let size_pos = w.position();
    w.write_u32(0);
    w.write_u16(irep.debug.len() as u16);
    for file in &irep.debug {
        w.write_u32(file.start_pos);
        let idx = filenames
            .iter()
            .position(|n| *n == file.filename)
            .expect("filename collected");
        w.write_u16(idx as u16);
        match &file.lines {
            DebugLines::Ary(lines) => {
                w.write_u32(lines.len() as u32);
                w.write_u8(0);
                for &line in lines {
                    w.write_u16(line);
                }
            }
            DebugLines::FlatMap(map) => {
                w.write_u32(map.len() as u32);
                w.write_u8(1);
                for &(pc, line) in map {
                    w.write_u32(pc);
                    w.write_u16(line);
                }
            }
        }
    }
    let len = w.position() - start;
    w.patch_u32(size_pos, len as u32);
    for child in &irep.reps {
        write_debug_record(w, child, filenames);
    }
}
