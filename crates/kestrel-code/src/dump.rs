use std::fmt::Write as _;

use crate::{CompiledBody, Instr};

fn write_instr(out: &mut String, z: &Instr) {
    out.push_str(z.op.name());
    let _ = write!(out, " {} {} {} {}", z.v1, z.v2, z.v3, z.v4);
    if let Some(c) = &z.c {
        let _ = write!(out, " ({})", c.val);
    }
    if let Some(aux) = &z.aux {
        out.push_str(" [");
        for (i, item) in aux.items.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            match &item.constant {
                Some(c) => {
                    let _ = write!(out, "{}", c.val);
                }
                None => {
                    let _ = write!(out, "s{}", item.slot);
                }
            }
        }
        out.push(']');
        if let Some(iter) = &aux.iter {
            let _ = write!(out, " loop-vars {:?}", iter.loop_vars.as_slice());
        }
    }
    if let Some(f) = &z.callee {
        let _ = write!(out, " <{f}>");
    }
    if let Some(ev) = &z.event {
        let _ = write!(out, " <event {}>", ev.name);
    }
    out.push('\n');
}

fn write_stream(out: &mut String, insts: &[Instr]) {
    for (i, z) in insts.iter().enumerate() {
        let _ = write!(out, "{i}");
        if !z.live {
            out.push_str(" (dead)");
        }
        if z.loop_depth > 0 {
            let _ = write!(out, " (loop {})", z.loop_depth);
        }
        out.push_str(": ");
        write_instr(out, z);
    }
}

pub(crate) fn dump_body(body: &CompiledBody) -> String {
    let mut out = String::new();

    if body.remapped {
        out.push_str("Original frame:\n");
    }
    for (slot, id) in body.frame_denizens.iter().enumerate() {
        let _ = writeln!(out, "frame[{slot}] = {id}");
    }

    if body.remapped {
        out.push_str("Final frame:\n");
        for (slot, info) in body.shared_frame.iter().enumerate() {
            let _ = write!(out, "frame2[{slot}] =");
            for id in &info.ids {
                let _ = write!(out, " {id}");
            }
            out.push('\n');
        }
    }

    if !body.insts2.is_empty() {
        out.push_str("Pre-removal of dead code:\n");
    }
    write_stream(&mut out, &body.insts1);

    if !body.insts2.is_empty() {
        out.push_str("Final code:\n");
        write_stream(&mut out, &body.insts2);
    }

    for (i, cases) in body.cases.int_cases.iter().enumerate() {
        let _ = write!(out, "int switch table #{i}:");
        for (k, pc) in cases {
            let _ = write!(out, " {k}->{pc}");
        }
        out.push('\n');
    }
    for (i, cases) in body.cases.uint_cases.iter().enumerate() {
        let _ = write!(out, "uint switch table #{i}:");
        for (k, pc) in cases {
            let _ = write!(out, " {k}->{pc}");
        }
        out.push('\n');
    }
    for (i, cases) in body.cases.double_cases.iter().enumerate() {
        let _ = write!(out, "double switch table #{i}:");
        for (k, pc) in cases {
            let _ = write!(out, " {}->{pc}", f64::from_bits(*k));
        }
        out.push('\n');
    }
    for (i, cases) in body.cases.str_cases.iter().enumerate() {
        let _ = write!(out, "str switch table #{i}:");
        for (k, pc) in cases {
            let _ = write!(out, " {k}->{pc}");
        }
        out.push('\n');
    }

    out
}
