//! Value rendering: program output, debug dumps, leak reports.
//!
//! Rendering is driven by the runtime tag; the optional static type adds
//! what tags cannot (enum value names). Depth and byte budgets bound the
//! output so cyclic or huge structures cannot wedge the error path.

use crate::vm::Vm;
use quill_bytecode::TypeInfo;
use quill_core::{PrintPrefs, RefId, Value, ValueType};
use quill_runtime::ObjPayload;

impl Vm {
    pub(crate) fn value_to_string(
        &self,
        sd: &mut String,
        v: Value,
        ti: Option<&TypeInfo>,
        pp: &PrintPrefs,
        depth: usize,
    ) {
        if sd.len() > pp.budget {
            sd.push_str("..");
            return;
        }
        match v.tag() {
            ValueType::Nil => sd.push_str("nil"),
            ValueType::Int => {
                let enumidx = ti.map_or(-1, |t| t.enumidx);
                if enumidx >= 0 && self.enum_name_val(sd, v.ival(), enumidx) {
                    return;
                }
                sd.push_str(&v.ival().to_string());
            }
            ValueType::Float => push_float(sd, v.fval()),
            ValueType::Function => sd.push_str("<function>"),
            t if t.is_ref() => self.ref_to_string(sd, v.refid(), pp, depth),
            t => {
                sd.push('<');
                sd.push_str(t.name());
                sd.push('>');
            }
        }
    }

    pub(crate) fn ref_to_string(&self, sd: &mut String, id: RefId, pp: &PrintPrefs, depth: usize) {
        if !self.heap.is_live(id) {
            sd.push_str("<dangling>");
            return;
        }
        if depth > pp.depth {
            sd.push_str("..");
            return;
        }
        let tti = self.heap.header(id).tti;
        match self.heap.payload(id) {
            ObjPayload::Str(_) => {
                let s = self.heap.str_str(id);
                if pp.quoted {
                    push_quoted(sd, s);
                } else {
                    sd.push_str(s);
                }
            }
            ObjPayload::Vector(elems) => {
                let elem_ti = if tti >= 0 {
                    let ti = self.image.type_info(tti);
                    (ti.subt >= 0).then(|| self.image.type_info(ti.subt))
                } else {
                    None
                };
                sd.push('[');
                for (i, &e) in elems.iter().enumerate() {
                    if i > 0 {
                        sd.push_str(", ");
                    }
                    if sd.len() > pp.budget {
                        sd.push_str("..");
                        break;
                    }
                    self.value_to_string(sd, e, elem_ti.as_ref(), pp, depth + 1);
                }
                sd.push(']');
            }
            ObjPayload::Object(fields) => {
                let ti = (tti >= 0).then(|| self.image.type_info(tti));
                if let Some(ti) = &ti {
                    sd.push_str(self.struct_name(ti));
                }
                sd.push('{');
                for (i, &f) in fields.iter().enumerate() {
                    if i > 0 {
                        sd.push_str(", ");
                    }
                    if sd.len() > pp.budget {
                        sd.push_str("..");
                        break;
                    }
                    let fti = ti
                        .as_ref()
                        .and_then(|t| self.image.elem_types(t).get(i).copied())
                        .map(|et| self.image.type_info(et));
                    self.value_to_string(sd, f, fti.as_ref(), pp, depth + 1);
                }
                sd.push('}');
            }
            ObjPayload::Resource { rt, .. } => {
                sd.push_str("(resource:");
                sd.push_str(rt.name);
                sd.push(')');
            }
        }
    }

    /// Render an enum value's name, composing `A|B` for flag enums.
    /// Returns false (output unchanged) when the value has unknown bits.
    pub(crate) fn enum_name_val(&self, sd: &mut String, enum_val: i64, enumidx: i32) -> bool {
        let enum_def = &self.image.enums()[enumidx as usize];
        let lookup = |sd: &mut String, val: i64| -> bool {
            for v in &enum_def.vals {
                if v.val == val {
                    sd.push_str(&v.name);
                    return true;
                }
            }
            false
        };
        if enum_def.flags == 0 || enum_val == 0 {
            return lookup(sd, enum_val);
        }
        let start = sd.len();
        let upto = 64 - (enum_val as u64).leading_zeros() as i64;
        for i in 0..upto {
            let bit = enum_val & (1i64 << i);
            if bit != 0 {
                if sd.len() != start {
                    sd.push('|');
                }
                if !lookup(sd, bit) {
                    // Unknown bits; can't display this properly.
                    sd.truncate(start);
                    return false;
                }
            }
        }
        true
    }

    /// Human-readable name of a static type.
    pub(crate) fn proper_type_name(&self, ti: &TypeInfo) -> String {
        match ti.t {
            ValueType::Class | ValueType::StructValue | ValueType::StructRef => {
                self.struct_name(ti).to_owned()
            }
            ValueType::Nil => {
                let sub = self.image.type_info(ti.subt);
                self.proper_type_name(&sub) + "?"
            }
            ValueType::Vector => {
                let sub = self.image.type_info(ti.subt);
                format!("[{}]", self.proper_type_name(&sub))
            }
            ValueType::Int if ti.enumidx >= 0 => {
                self.image.enums()[ti.enumidx as usize].name.to_string()
            }
            t => t.name().to_owned(),
        }
    }

    pub(crate) fn struct_name(&self, ti: &TypeInfo) -> &str {
        &self.image.udts()[ti.structidx as usize].name
    }
}

fn push_float(sd: &mut String, f: f64) {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e17 {
        sd.push_str(&format!("{:.1}", f));
    } else {
        sd.push_str(&format!("{}", f));
    }
}

fn push_quoted(sd: &mut String, s: &str) {
    sd.push('"');
    for c in s.chars() {
        match c {
            '"' => sd.push_str("\\\""),
            '\\' => sd.push_str("\\\\"),
            '\n' => sd.push_str("\\n"),
            '\t' => sd.push_str("\\t"),
            c if (c as u32) < 0x20 => sd.push_str(&format!("\\x{:02x}", c as u32)),
            c => sd.push(c),
        }
    }
    sd.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_float_trims() {
        let mut sd = String::new();
        push_float(&mut sd, 2.0);
        assert_eq!(sd, "2.0");
        sd.clear();
        push_float(&mut sd, 2.5);
        assert_eq!(sd, "2.5");
    }

    #[test]
    fn test_quoting() {
        let mut sd = String::new();
        push_quoted(&mut sd, "a\"b\n");
        assert_eq!(sd, "\"a\\\"b\\n\"");
    }
}
