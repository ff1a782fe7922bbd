//! Verified bytecode image: loader, section decode, type-table views.
//!
//! The on-disk format is little-endian 32-bit words:
//!
//! ```text
//! [magic][version][nsections] ([tag][word_off][word_len])*  payload...
//! ```
//!
//! Word decoding always goes through `i32::from_le_bytes`, so the decoded
//! word sequence is identical on little- and big-endian hosts (the
//! big-endian "mirror" of the original design collapses into this single
//! copy; zero-copy on LE hosts is explicitly not a goal). After `load`
//! succeeds the image is immutable and can be shared across worker VMs.

use crate::opcodes::{parse_op_and_get_arity, Opcode};
use quill_core::{ValueType, VmError, VmResult};

/// Bumped whenever the word layout changes; images from other versions
/// are rejected before VM construction.
pub const BYTECODE_VERSION: i32 = 4;

const MAGIC: i32 = 0x43424C51; // "QLBC"

pub(crate) fn magic() -> i32 {
    MAGIC
}

// Section tags.
pub(crate) const SEC_CODE: i32 = 1;
pub(crate) const SEC_TYPETABLE: i32 = 2;
pub(crate) const SEC_SPECIDENTS: i32 = 3;
pub(crate) const SEC_IDENTS: i32 = 4;
pub(crate) const SEC_FUNCTIONS: i32 = 5;
pub(crate) const SEC_UDTS: i32 = 6;
pub(crate) const SEC_ENUMS: i32 = 7;
pub(crate) const SEC_STRINGTABLE: i32 = 8;
pub(crate) const SEC_FILENAMES: i32 = 9;
pub(crate) const SEC_LINETABLE: i32 = 10;
pub(crate) const SEC_VTABLES: i32 = 11;
pub(crate) const SEC_INTVECTYPES: i32 = 12;
pub(crate) const SEC_FLOATVECTYPES: i32 = 13;

// =============================================================================
// Decoded records
// =============================================================================

/// Specialized identifier: one global variable slot.
#[derive(Debug, Clone, Copy)]
pub struct SpecIdent {
    pub ididx: i32,
    pub typeidx: i32,
}

/// Identifier metadata shared by its specializations.
#[derive(Debug, Clone)]
pub struct Ident {
    pub name: Box<str>,
    pub readonly: bool,
    pub global: bool,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Box<str>,
    /// Code index of the function's FUNSTART instruction.
    pub bytecode_start: i32,
}

/// User-defined type (class or struct).
#[derive(Debug, Clone)]
pub struct Udt {
    pub name: Box<str>,
    /// First slot of this type's methods in the vtable array, or -1.
    pub vtable_start: i32,
    pub nfields: i32,
}

#[derive(Debug, Clone)]
pub struct EnumVal {
    pub name: Box<str>,
    pub val: i64,
}

#[derive(Debug, Clone)]
pub struct EnumDef {
    pub name: Box<str>,
    /// Non-zero when the enum is a bitflag set (renders as `A|B`).
    pub flags: i32,
    pub vals: Vec<EnumVal>,
}

#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    pub ip: i32,
    pub line: i32,
    pub fileidx: i32,
}

// =============================================================================
// Type descriptors
// =============================================================================

/// Decoded view of one type-table entry. Entries are variable-length
/// words: `[t, subt]` for vector/nil, `[t, enumidx]` for int,
/// `[t, structidx, len, elemtypes...]` for UDTs, `[t]` otherwise.
#[derive(Debug, Clone, Copy)]
pub struct TypeInfo {
    pub t: ValueType,
    /// Element type for vector, wrapped type for nil; -1 otherwise.
    pub subt: i32,
    /// Enum table index for int types; -1 otherwise.
    pub enumidx: i32,
    /// UDT table index for class/struct types; -1 otherwise.
    pub structidx: i32,
    /// Field count for class/struct types; 0 otherwise.
    pub len: i32,
    /// Type-table offset of the inline element-type list.
    elems_off: usize,
}

// =============================================================================
// Image
// =============================================================================

/// A structurally verified, read-only program image.
#[derive(Debug)]
pub struct BytecodeImage {
    words: Vec<i32>,
    code: std::ops::Range<usize>,
    typetable: std::ops::Range<usize>,
    specidents: Vec<SpecIdent>,
    idents: Vec<Ident>,
    functions: Vec<FunctionDef>,
    udts: Vec<Udt>,
    enums: Vec<EnumDef>,
    strings: Vec<Box<str>>,
    filenames: Vec<Box<str>>,
    linetable: Vec<LineEntry>,
    vtables: Vec<i32>,
    default_int_vector_types: Vec<i32>,
    default_float_vector_types: Vec<i32>,
    version: i32,
}

struct Sections<'a> {
    words: &'a [i32],
    dir: Vec<(i32, usize, usize)>,
}

impl<'a> Sections<'a> {
    fn get(&self, tag: i32) -> VmResult<&'a [i32]> {
        for &(t, off, len) in &self.dir {
            if t == tag {
                return Ok(&self.words[off..off + len]);
            }
        }
        Err(VmError::malformed(format!("bytecode file missing section {tag}")))
    }
}

fn malformed(what: &str) -> VmError {
    VmError::malformed(format!("bytecode file failed to verify: {what}"))
}

fn decode_strings(payload: &[i32], what: &str) -> VmResult<Vec<Box<str>>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    let count = *payload.first().ok_or_else(|| malformed(what))? as usize;
    pos += 1;
    for _ in 0..count {
        let nbytes = *payload.get(pos).ok_or_else(|| malformed(what))? as usize;
        pos += 1;
        let nwords = nbytes.div_ceil(4);
        let words = payload.get(pos..pos + nwords).ok_or_else(|| malformed(what))?;
        pos += nwords;
        let mut bytes = Vec::with_capacity(nbytes);
        for w in words {
            bytes.extend_from_slice(&w.to_le_bytes());
        }
        bytes.truncate(nbytes);
        let s = String::from_utf8(bytes).map_err(|_| malformed(what))?;
        out.push(s.into_boxed_str());
    }
    if pos != payload.len() {
        return Err(malformed(what));
    }
    Ok(out)
}

fn fixed_records<T>(
    payload: &[i32],
    stride: usize,
    what: &str,
    f: impl Fn(&[i32]) -> VmResult<T>,
) -> VmResult<Vec<T>> {
    let count = *payload.first().ok_or_else(|| malformed(what))? as usize;
    let body = &payload[1..];
    if body.len() != count * stride {
        return Err(malformed(what));
    }
    body.chunks_exact(stride).map(|c| f(c)).collect()
}

impl BytecodeImage {
    /// Verify and load an image from its serialized bytes.
    ///
    /// Rejects short buffers, bad magic, unknown versions, out-of-bounds
    /// section directories, malformed string pools, undecodable type
    /// tables, streams containing unknown opcodes, and images whose first
    /// instruction is not `JUMP <start>`.
    pub fn load(bytes: &[u8]) -> VmResult<BytecodeImage> {
        if bytes.len() % 4 != 0 {
            return Err(malformed("length not word-aligned"));
        }
        let words: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        if words.len() < 3 {
            return Err(malformed("truncated header"));
        }
        if words[0] != MAGIC {
            return Err(malformed("bad magic"));
        }
        let version = words[1];
        if version != BYTECODE_VERSION {
            return Err(VmError::version_mismatch(format!(
                "bytecode is from a different version of Quill (found {version}, expected {BYTECODE_VERSION})"
            )));
        }
        let nsections = words[2] as usize;
        let dir_end = 3 + nsections * 3;
        if dir_end > words.len() {
            return Err(malformed("truncated section directory"));
        }
        let mut dir = Vec::with_capacity(nsections);
        for i in 0..nsections {
            let tag = words[3 + i * 3];
            let off = words[3 + i * 3 + 1];
            let len = words[3 + i * 3 + 2];
            if off < dir_end as i32 || len < 0 || (off as usize + len as usize) > words.len() {
                return Err(malformed("section out of bounds"));
            }
            dir.push((tag, off as usize, len as usize));
        }
        let sections = Sections { words: &words, dir };

        let strings = decode_strings(sections.get(SEC_STRINGTABLE)?, "stringtable")?;
        let filenames = decode_strings(sections.get(SEC_FILENAMES)?, "filenames")?;

        let specidents = fixed_records(sections.get(SEC_SPECIDENTS)?, 2, "specidents", |c| {
            Ok(SpecIdent { ididx: c[0], typeidx: c[1] })
        })?;
        let nstrings = strings.len() as i32;
        let take_name = |sidx: i32, what: &str| -> VmResult<Box<str>> {
            if (0..nstrings).contains(&sidx) {
                Ok(strings[sidx as usize].clone())
            } else {
                Err(malformed(what))
            }
        };
        let idents = fixed_records(sections.get(SEC_IDENTS)?, 3, "idents", |c| {
            Ok(Ident { name: take_name(c[0], "idents")?, readonly: c[1] != 0, global: c[2] != 0 })
        })?;
        for si in &specidents {
            if !(0..idents.len() as i32).contains(&si.ididx) {
                return Err(malformed("specident ident index"));
            }
        }
        let functions = fixed_records(sections.get(SEC_FUNCTIONS)?, 2, "functions", |c| {
            Ok(FunctionDef { name: take_name(c[0], "functions")?, bytecode_start: c[1] })
        })?;
        let udts = fixed_records(sections.get(SEC_UDTS)?, 3, "udts", |c| {
            Ok(Udt { name: take_name(c[0], "udts")?, vtable_start: c[1], nfields: c[2] })
        })?;
        let linetable = fixed_records(sections.get(SEC_LINETABLE)?, 3, "linetable", |c| {
            Ok(LineEntry { ip: c[0], line: c[1], fileidx: c[2] })
        })?;

        let enums_payload = sections.get(SEC_ENUMS)?;
        let mut enums = Vec::new();
        {
            let count = *enums_payload.first().ok_or_else(|| malformed("enums"))? as usize;
            let mut pos = 1usize;
            for _ in 0..count {
                let head = enums_payload.get(pos..pos + 3).ok_or_else(|| malformed("enums"))?;
                pos += 3;
                let nvals = head[2] as usize;
                let mut vals = Vec::with_capacity(nvals);
                for _ in 0..nvals {
                    let v = enums_payload.get(pos..pos + 3).ok_or_else(|| malformed("enums"))?;
                    pos += 3;
                    let val = (v[1] as u32 as i64) | ((v[2] as i64) << 32);
                    vals.push(EnumVal { name: take_name(v[0], "enums")?, val });
                }
                enums.push(EnumDef { name: take_name(head[0], "enums")?, flags: head[1], vals });
            }
            if pos != enums_payload.len() {
                return Err(malformed("enums"));
            }
        }

        let vtables = sections.get(SEC_VTABLES)?.to_vec();
        let default_int_vector_types = sections.get(SEC_INTVECTYPES)?.to_vec();
        let default_float_vector_types = sections.get(SEC_FLOATVECTYPES)?.to_vec();

        let code_range = {
            let (_, off, len) =
                *sections.dir.iter().find(|s| s.0 == SEC_CODE).ok_or_else(|| malformed("code"))?;
            off..off + len
        };
        let typetable_range = {
            let (_, off, len) = *sections
                .dir
                .iter()
                .find(|s| s.0 == SEC_TYPETABLE)
                .ok_or_else(|| malformed("typetable"))?;
            off..off + len
        };

        let image = BytecodeImage {
            code: code_range,
            typetable: typetable_range,
            specidents,
            idents,
            functions,
            udts,
            enums,
            strings,
            filenames,
            linetable,
            vtables,
            default_int_vector_types,
            default_float_vector_types,
            version,
            words,
        };

        image.verify_code()?;
        Ok(image)
    }

    /// Walk the whole instruction stream once; every opcode must decode
    /// and every instruction must fit. The first instruction must be the
    /// `JUMP <starting_offset>` the entry point reads.
    fn verify_code(&self) -> VmResult<()> {
        let code = self.code();
        if code.is_empty() {
            return Err(malformed("empty code"));
        }
        if code[0] != Opcode::Jump as i32 {
            return Err(malformed("first instruction must be JUMP"));
        }
        let mut ip = 0usize;
        while ip < code.len() {
            match parse_op_and_get_arity(code, ip) {
                Some(p) => ip = p.next_ip,
                None => {
                    return Err(malformed(&format!("bad opcode {} at {}", code[ip], ip)));
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[inline]
    pub fn code(&self) -> &[i32] {
        &self.words[self.code.clone()]
    }

    /// The whole serialized buffer as words (embedded verbatim by the
    /// AOT translator's runtime-typed mode).
    #[inline]
    pub fn words(&self) -> &[i32] {
        &self.words
    }

    #[inline]
    pub fn typetable(&self) -> &[i32] {
        &self.words[self.typetable.clone()]
    }

    #[inline]
    pub fn version(&self) -> i32 {
        self.version
    }

    pub fn specidents(&self) -> &[SpecIdent] {
        &self.specidents
    }

    pub fn idents(&self) -> &[Ident] {
        &self.idents
    }

    pub fn functions(&self) -> &[FunctionDef] {
        &self.functions
    }

    pub fn udts(&self) -> &[Udt] {
        &self.udts
    }

    pub fn enums(&self) -> &[EnumDef] {
        &self.enums
    }

    pub fn string(&self, sidx: i32) -> &str {
        &self.strings[sidx as usize]
    }

    pub fn nstrings(&self) -> usize {
        self.strings.len()
    }

    pub fn filename(&self, fidx: i32) -> &str {
        &self.filenames[fidx as usize]
    }

    pub fn vtables(&self) -> &[i32] {
        &self.vtables
    }

    pub fn default_int_vector_type(&self, which: usize) -> i32 {
        self.default_int_vector_types.get(which).copied().unwrap_or(-1)
    }

    pub fn default_float_vector_type(&self, which: usize) -> i32 {
        self.default_float_vector_types.get(which).copied().unwrap_or(-1)
    }

    /// The `JUMP` target of instruction 0: where evaluation starts.
    pub fn starting_ip(&self) -> usize {
        // Verified: code[0] is JUMP, layout [JUMP, regso, target].
        self.code()[2] as usize
    }

    /// Ident metadata for a global variable slot.
    pub fn var_ident(&self, varidx: i32) -> &Ident {
        &self.idents[self.specidents[varidx as usize].ididx as usize]
    }

    /// Static type of a global variable slot.
    pub fn var_type(&self, varidx: i32) -> TypeInfo {
        self.type_info(self.specidents[varidx as usize].typeidx)
    }

    /// Decode the type-table entry at `tti`. The table is trusted after
    /// load; indexes out of range are a producer bug and panic.
    pub fn type_info(&self, tti: i32) -> TypeInfo {
        let tt = self.typetable();
        let off = tti as usize;
        let t = ValueType::from_i32(tt[off]).expect("corrupt type table");
        let mut ti = TypeInfo { t, subt: -1, enumidx: -1, structidx: -1, len: 0, elems_off: 0 };
        match t {
            ValueType::Vector | ValueType::Nil => ti.subt = tt[off + 1],
            ValueType::Int => ti.enumidx = tt[off + 1],
            ValueType::Class | ValueType::StructValue | ValueType::StructRef => {
                ti.structidx = tt[off + 1];
                ti.len = tt[off + 2];
                ti.elems_off = off + 3;
            }
            _ => {}
        }
        ti
    }

    /// Inline element-type index list of a UDT descriptor.
    pub fn elem_types(&self, ti: &TypeInfo) -> &[i32] {
        &self.typetable()[ti.elems_off..ti.elems_off + ti.len as usize]
    }

    /// Last line-table entry at or before `ip` (errors usually point at
    /// the byte before the current ip, which callers account for).
    pub fn lookup_line(&self, ip: usize) -> Option<&LineEntry> {
        let pos = self.linetable.partition_point(|e| e.ip as usize <= ip);
        pos.checked_sub(1).map(|i| &self.linetable[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ImageBuilder;

    fn minimal_image_bytes() -> Vec<u8> {
        let mut b = ImageBuilder::new();
        let t_int = b.type_simple(ValueType::Int);
        let start = b.fun_start(-1, 1, &[], &[], 0, &[]);
        b.op(Opcode::PushInt, &[7]);
        b.op(Opcode::Exit, &[t_int]);
        b.set_entry(start);
        b.finish()
    }

    #[test]
    fn test_load_roundtrip() {
        let bytes = minimal_image_bytes();
        let img = BytecodeImage::load(&bytes).unwrap();
        assert_eq!(img.version(), BYTECODE_VERSION);
        assert_eq!(img.code()[0], Opcode::Jump as i32);
        let start = img.starting_ip();
        assert_eq!(img.code()[start], Opcode::FunStart as i32);
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut bytes = minimal_image_bytes();
        bytes[4] = 99; // version word
        let err = BytecodeImage::load(&bytes).unwrap_err();
        assert_eq!(err.kind, quill_core::VmErrorKind::BytecodeVersionMismatch);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = minimal_image_bytes();
        bytes[0] = 0;
        let err = BytecodeImage::load(&bytes).unwrap_err();
        assert_eq!(err.kind, quill_core::VmErrorKind::BytecodeMalformed);
    }

    #[test]
    fn test_truncation_rejected() {
        let bytes = minimal_image_bytes();
        for cut in [1, 5, 9, bytes.len() - 4] {
            assert!(BytecodeImage::load(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_corrupt_opcode_rejected() {
        let bytes = minimal_image_bytes();
        let img = BytecodeImage::load(&bytes).unwrap();
        // Find the PUSHINT inside the serialized buffer and clobber it.
        let code_start = (bytes.len() - img.code().len() * 4) / 4;
        let mut words: Vec<i32> = bytes
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let target = img
            .code()
            .iter()
            .position(|&w| w == Opcode::PushInt as i32)
            .map(|i| code_start + i)
            .unwrap();
        words[target] = 0x7fff;
        let bad: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        assert!(BytecodeImage::load(&bad).is_err());
    }

    #[test]
    fn test_endian_independent_decode() {
        // The word decoder is from_le_bytes on every host, so the decoded
        // stream equals the builder's words regardless of host endianness.
        let bytes = minimal_image_bytes();
        let img = BytecodeImage::load(&bytes).unwrap();
        assert_eq!(img.code()[0], Opcode::Jump as i32);
        assert_eq!(img.code()[2] as usize, img.starting_ip());
    }
}
