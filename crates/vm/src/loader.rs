//! Reader for the rite compiled-unit format.
//!
//! A compiled unit is a checksummed header followed by tagged sections and
//! an end footer. The `IREP` section carries the recursive irep tree; the
//! optional `LVAR` and `DBG ` sections attach local-variable names and
//! source line maps to the same tree. The binary ident selects the payload
//! byte order; everything is validated before any of it reaches the VM.

use crate::error::{VmError, VmResult};
use crate::irep::{DebugFile, DebugLines, Irep, LvEntry, PoolValue};
use crate::value::Int;
use crate::vm::Vm;
use rite_io::{crc16_ccitt, BinaryReader, Endian};
use std::rc::Rc;

pub const RITE_BINARY_IDENT: &[u8; 4] = b"RITE";
pub const RITE_BINARY_IDENT_LIL: &[u8; 4] = b"RITL";
pub const RITE_BINARY_VERSION: &[u8; 4] = b"0300";
pub const RITE_COMPILER_NAME: &[u8; 4] = b"RSVM";
pub const RITE_COMPILER_VERSION: &[u8; 4] = b"0001";

pub const SECTION_IREP_IDENT: &[u8; 4] = b"IREP";
pub const SECTION_LVAR_IDENT: &[u8; 4] = b"LVAR";
pub const SECTION_DBG_IDENT: &[u8; 4] = b"DBG\0";
pub const SECTION_EOF_IDENT: &[u8; 4] = b"END\0";

/// Size of the binary header in bytes.
pub const BINARY_HEADER_SIZE: usize = 22;

/// "No symbol" marker in syms and lvar blocks.
pub const RITE_SYM_NONE: u16 = 0xffff;

/// Parses a compiled unit into an irep tree, interning its symbols into the
/// VM's table.
pub fn read_rite(vm: &mut Vm, bytes: &[u8]) -> VmResult<Rc<Irep>> {
    if bytes.len() < BINARY_HEADER_SIZE {
        return Err(VmError::script("binary too short for rite header"));
    }
    let endian = match &bytes[0..4] {
        id if id == RITE_BINARY_IDENT => Endian::Big,
        id if id == RITE_BINARY_IDENT_LIL => Endian::Little,
        _ => return Err(VmError::script("bad rite binary ident")),
    };
    let mut r = BinaryReader::new(bytes, endian);
    r.read_ident()?; // ident, checked above
    let _version = r.read_ident()?;
    let _compiler_name = r.read_ident()?;
    let _compiler_version = r.read_ident()?;
    let size = r.read_u32()? as usize;
    if size != bytes.len() {
        return Err(VmError::script(format!(
            "rite size mismatch: header says {size}, binary is {}",
            bytes.len()
        )));
    }
    let crc = r.read_u16()?;
    let computed = crc16_ccitt(&bytes[BINARY_HEADER_SIZE..], 0);
    if crc != computed {
        return Err(VmError::script(format!(
            "rite checksum mismatch: expected {crc:#06x}, computed {computed:#06x}"
        )));
    }

    let mut irep: Option<Rc<Irep>> = None;
    loop {
        let ident = r.read_ident()?;
        let sec_size = r.read_u32()? as usize;
        if sec_size < 8 {
            return Err(VmError::script("rite section size too small"));
        }
        if &ident == SECTION_EOF_IDENT {
            break;
        }
        let payload_end = r.position() + (sec_size - 8);
        if payload_end > bytes.len() {
            return Err(VmError::script("rite section overruns binary"));
        }
        if &ident == SECTION_IREP_IDENT {
            let root = read_irep_record(vm, &mut r)?;
            irep = Some(assemble(root));
        } else if &ident == SECTION_LVAR_IDENT {
            if let Some(root) = irep.take() {
                let mut tree = disassemble(&root);
                read_lvar_section(vm, &mut r, &mut tree)?;
                irep = Some(assemble(tree));
            }
        } else if &ident == SECTION_DBG_IDENT {
            if let Some(root) = irep.take() {
                let mut tree = disassemble(&root);
                read_debug_section(&mut r, &mut tree)?;
                irep = Some(assemble(tree));
            }
        }
        // unknown sections are skipped wholesale
        r.set_position(payload_end)?;
    }
    irep.ok_or_else(|| VmError::script("rite binary has no IREP section"))
}

/// A mutable irep tree used while sections are still being attached.
struct IrepNode {
    irep: Irep,
    children: Vec<IrepNode>,
}

fn assemble(node: IrepNode) -> Rc<Irep> {
    let mut irep = node.irep;
    irep.reps = node.children.into_iter().map(assemble).collect();
    Rc::new(irep)
}

/// Rebuilds a mutable tree from a loaded irep (sections arrive in file
/// order, so attachment happens before the tree is shared).
fn disassemble(irep: &Rc<Irep>) -> IrepNode {
    IrepNode {
        irep: Irep {
            nlocals: irep.nlocals,
            nregs: irep.nregs,
            flags: irep.flags,
            iseq: irep.iseq.clone(),
            pool: irep.pool.clone(),
            syms: irep.syms.clone(),
            reps: Vec::new(),
            lvars: irep.lvars.clone(),
            debug: irep.debug.clone(),
        },
        children: irep.reps.iter().map(disassemble).collect(),
    }
}

fn read_irep_record(vm: &mut Vm, r: &mut BinaryReader<'_>) -> VmResult<IrepNode> {
    let record_start = r.position();
    let record_size = r.read_u32()? as usize;
    let nlocals = r.read_u16()?;
    let nregs = r.read_u16()?;
    let nreps = r.read_u16()? as usize;

    // instruction block, 4-byte aligned within the stream
    let ilen = r.read_u32()? as usize;
    r.align(4)?;
    let iseq = r.read_bytes(ilen)?.to_vec();

    // constant pool
    let plen = r.read_u32()? as usize;
    let mut pool = Vec::with_capacity(plen);
    for _ in 0..plen {
        let tt = r.read_u8()?;
        let len = r.read_u16()? as usize;
        let data = r.read_bytes(len)?;
        let entry = match tt {
            0 => PoolValue::Str(
                String::from_utf8(data.to_vec())
                    .map_err(|_| VmError::script("pool string is not valid UTF-8"))?,
            ),
            1 => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| VmError::script("pool fixnum is not valid UTF-8"))?;
                PoolValue::Fixnum(
                    text.parse::<Int>()
                        .map_err(|_| VmError::script("bad fixnum literal in pool"))?,
                )
            }
            2 => {
                let text = std::str::from_utf8(data)
                    .map_err(|_| VmError::script("pool float is not valid UTF-8"))?;
                PoolValue::Float(
                    text.parse::<f64>()
                        .map_err(|_| VmError::script("bad float literal in pool"))?,
                )
            }
            other => {
                return Err(VmError::script(format!(
                    "unknown pool entry type {other}"
                )))
            }
        };
        pool.push(entry);
    }

    // symbol block
    let slen = r.read_u32()? as usize;
    let mut syms = Vec::with_capacity(slen);
    for _ in 0..slen {
        let len = r.read_u16()?;
        if len == RITE_SYM_NONE {
            // anonymous slot; intern a reserved name to keep indexes dense
            syms.push(vm.intern(""));
            continue;
        }
        let name = r.read_bytes(len as usize)?;
        let _nul = r.read_u8()?;
        let name = std::str::from_utf8(name)
            .map_err(|_| VmError::script("symbol is not valid UTF-8"))?
            .to_string();
        syms.push(vm.intern(&name));
    }

    let mut children = Vec::with_capacity(nreps);
    for _ in 0..nreps {
        children.push(read_irep_record(vm, r)?);
    }

    let consumed = r.position() - record_start;
    if consumed != record_size {
        return Err(VmError::script(format!(
            "irep record size mismatch: declared {record_size}, read {consumed}"
        )));
    }

    Ok(IrepNode {
        irep: Irep {
            nlocals,
            nregs,
            flags: 0,
            iseq,
            pool,
            syms,
            reps: Vec::new(),
            lvars: Vec::new(),
            debug: Vec::new(),
        },
        children,
    })
}

fn read_lvar_section(
    vm: &mut Vm,
    r: &mut BinaryReader<'_>,
    tree: &mut IrepNode,
) -> VmResult<()> {
    let nsyms = r.read_u32()? as usize;
    let mut table = Vec::with_capacity(nsyms);
    for _ in 0..nsyms {
        let len = r.read_u16()? as usize;
        let name = r.read_bytes(len)?;
        let name = std::str::from_utf8(name)
            .map_err(|_| VmError::script("lvar symbol is not valid UTF-8"))?
            .to_string();
        table.push(vm.intern(&name));
    }
    read_lvar_record(r, &table, tree)
}

fn read_lvar_record(
    r: &mut BinaryReader<'_>,
    table: &[crate::symbol::Sym],
    node: &mut IrepNode,
) -> VmResult<()> {
    let n = node.irep.nlocals.saturating_sub(1) as usize;
    let mut lvars = Vec::with_capacity(n);
    for _ in 0..n {
        let idx = r.read_u16()?;
        let reg = r.read_u16()?;
        let name = if idx == RITE_SYM_NONE {
            None
        } else {
            Some(
                *table
                    .get(idx as usize)
                    .ok_or_else(|| VmError::script("lvar symbol index out of range"))?,
            )
        };
        lvars.push(LvEntry { name, reg });
    }
    node.irep.lvars = lvars;
    for child in &mut node.children {
        read_lvar_record(r, table, child)?;
    }
    Ok(())
}

fn read_debug_section(r: &mut BinaryReader<'_>, tree: &mut IrepNode) -> VmResult<()> {
    let nfiles = r.read_u16()? as usize;
    let mut filenames = Vec::with_capacity(nfiles);
    for _ in 0..nfiles {
        let len = r.read_u16()? as usize;
        let name = r.read_bytes(len)?;
        filenames.push(
            std::str::from_utf8(name)
                .map_err(|_| VmError::script("debug filename is not valid UTF-8"))?
                .to_string(),
        );
    }
    read_debug_record(r, &filenames, tree)
}

fn read_debug_record(
    r: &mut BinaryReader<'_>,
    filenames: &[String],
    node: &mut IrepNode,
) -> VmResult<()> {
    let start = r.position();
    let record_size = r.read_u32()? as usize;
    let file_count = r.read_u16()? as usize;
    let mut debug = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        let start_pos = r.read_u32()?;
        let fidx = r.read_u16()? as usize;
        let line_count = r.read_u32()? as usize;
        let line_type = r.read_u8()?;
        let filename = filenames
            .get(fidx)
            .ok_or_else(|| VmError::script("debug filename index out of range"))?
            .clone();
        let lines = match line_type {
            0 => {
                let mut lines = Vec::with_capacity(line_count);
                for _ in 0..line_count {
                    lines.push(r.read_u16()?);
                }
                DebugLines::Ary(lines)
            }
            1 => {
                let mut map = Vec::with_capacity(line_count);
                for _ in 0..line_count {
                    let pc = r.read_u32()?;
                    let line = r.read_u16()?;
                    map.push((pc, line));
                }
                DebugLines::FlatMap(map)
            }
            other => {
                return Err(VmError::script(format!(
                    "unknown debug line encoding {other}"
                )))
            }
        };
        debug.push(DebugFile {
            start_pos,
            filename,
            lines,
        });
    }
    let consumed = r.position() - start;
    if consumed != record_size {
        return Err(VmError::script("debug record size mismatch"));
    }
    node.irep.debug = debug;
    for child in &mut node.children {
        read_debug_record(r, filenames, child)?;
    }
    Ok(())
}
