use std::rc::Rc;

use kestrel_ast::{ConstVal, EventHandlerRef, Expr, Ident, TypeRef};
use smallvec::SmallVec;

use crate::Op;

/// Operand layout of one instruction. `V` marks an integer operand holding a
/// frame slot, `C` the embedded constant, `A` the aux block, `Frame` an
/// interpreter-frame offset, and `I<k>` re-tags the k-th integer operand as
/// a literal immediate (including concretized branch targets).
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperandForm {
    X,
    C,
    A,
    V,
    VA,
    VC,
    VCA,
    VV,
    VVA,
    VVC,
    VVV,
    VVVC,
    VVVV,
    VVFrame,
    ViC,
    V_I1,
    VV_I1_I2,
    VV_I2,
    VVA_I2,
    VVC_I2,
    VVV_I2_I3,
    VVV_I3,
    VVVA_I3,
    VVVC_I1_I2_I3,
    VVVV_I2_I3_I4,
}

impl OperandForm {
    /// Which of the integer operands (1-based) hold frame slots under this
    /// layout.
    pub fn slot_positions(self) -> &'static [u8] {
        use OperandForm::*;
        match self {
            X | C | A | V_I1 | VV_I1_I2 | VVVC_I1_I2_I3 => &[],
            V | VA | VC | VCA | VVFrame | ViC | VV_I2 | VVC_I2 | VVA_I2 | VVV_I2_I3 => &[1],
            VV | VVA | VVC | VVV_I3 | VVVA_I3 => &[1, 2],
            VVV | VVVC => &[1, 2, 3],
            VVVV => &[1, 2, 3, 4],
            VVVV_I2_I3_I4 => &[1],
        }
    }
}

/// A forward-patchable branch destination: an index into the first-pass
/// instruction vector. An index one past the end denotes the end of the
/// program (no instruction is ever materialized for it; concretization maps
/// it to the final stream length).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(pub usize);

/// One (slot, constant, type) triple of an aux block. Exactly one of `slot`
/// / `constant` is meaningful: slots are non-negative.
#[derive(Clone, Debug)]
pub struct AuxItem {
    pub slot: i32,
    pub constant: Option<ConstVal>,
    pub ty: TypeRef,
}

impl AuxItem {
    pub fn slot(slot: i32, ty: TypeRef) -> AuxItem {
        AuxItem {
            slot,
            constant: None,
            ty,
        }
    }

    pub fn constant(c: ConstVal) -> AuxItem {
        let ty = Rc::clone(&c.ty);
        AuxItem {
            slot: -1,
            constant: Some(c),
            ty,
        }
    }
}

/// Static loop-iteration information hanging off loop-init and loop-next
/// instructions.
#[derive(Clone, Debug, Default)]
pub struct IterInfo {
    pub loop_vars: SmallVec<[i32; 2]>,
    pub loop_var_types: Vec<TypeRef>,
    pub vec_type: Option<TypeRef>,
    pub yield_type: Option<TypeRef>,
}

/// Variable-length operands for calls, constructor literals, `in`-list
/// tests, and iteration.
#[derive(Clone, Debug, Default)]
pub struct InstrAux {
    pub items: SmallVec<[AuxItem; 4]>,
    pub iter: Option<IterInfo>,
}

impl InstrAux {
    pub fn with_items(items: SmallVec<[AuxItem; 4]>) -> Box<InstrAux> {
        Box::new(InstrAux {
            items,
            iter: None,
        })
    }
}

/// One instruction. Lowering creates it live with no incoming labels; the
/// optimizer mutates the liveness, label, and loop metadata in place.
#[derive(Clone, Debug)]
pub struct Instr {
    pub op: Op,
    pub op_type: OperandForm,
    pub v1: i32,
    pub v2: i32,
    pub v3: i32,
    pub v4: i32,
    pub c: Option<ConstVal>,
    pub t: Option<TypeRef>,
    pub aux: Option<Box<InstrAux>>,
    /// Direct-call callee, resolved by name through the host runtime.
    pub callee: Option<Ident>,
    /// Raised event handler.
    pub event: Option<EventHandlerRef>,
    /// Predicate expression handed to the host trigger mechanism.
    pub deferred_expr: Option<Rc<Expr>>,
    pub target: Option<Label>,
    pub target_slot: u8,
    pub target2: Option<Label>,
    pub target2_slot: u8,
    /// Whether `v1` names a managed slot the engine releases on assignment.
    pub is_managed: bool,
    pub live: bool,
    pub num_labels: u32,
    pub inst_num: usize,
    pub loop_depth: u32,
    pub loop_start: bool,
}

impl Instr {
    pub fn new(op: Op) -> Instr {
        Instr {
            op,
            op_type: op.form(),
            v1: 0,
            v2: 0,
            v3: 0,
            v4: 0,
            c: None,
            t: None,
            aux: None,
            callee: None,
            event: None,
            deferred_expr: None,
            target: None,
            target_slot: 0,
            target2: None,
            target2_slot: 0,
            is_managed: false,
            live: true,
            num_labels: 0,
            inst_num: 0,
            loop_depth: 0,
            loop_start: false,
        }
    }

    pub fn v(op: Op, v1: i32) -> Instr {
        let mut z = Instr::new(op);
        z.v1 = v1;
        z
    }

    pub fn vv(op: Op, v1: i32, v2: i32) -> Instr {
        let mut z = Instr::new(op);
        z.v1 = v1;
        z.v2 = v2;
        z
    }

    pub fn vvv(op: Op, v1: i32, v2: i32, v3: i32) -> Instr {
        let mut z = Instr::new(op);
        z.v1 = v1;
        z.v2 = v2;
        z.v3 = v3;
        z
    }

    pub fn vvvv(op: Op, v1: i32, v2: i32, v3: i32, v4: i32) -> Instr {
        let mut z = Instr::new(op);
        z.v1 = v1;
        z.v2 = v2;
        z.v3 = v3;
        z.v4 = v4;
        z
    }

    pub fn vc(op: Op, v1: i32, c: ConstVal) -> Instr {
        let mut z = Instr::new(op);
        z.v1 = v1;
        z.c = Some(c);
        z
    }

    pub fn vvc(op: Op, v1: i32, v2: i32, c: ConstVal) -> Instr {
        let mut z = Instr::new(op);
        z.v1 = v1;
        z.v2 = v2;
        z.c = Some(c);
        z
    }

    pub fn with_type(mut self, t: TypeRef) -> Instr {
        self.t = Some(t);
        self
    }

    /// Marks the destination managed when the destination type owns heap
    /// storage, so the engine releases the prior value on assignment.
    pub fn check_if_managed(&mut self, t: &TypeRef) {
        if t.is_managed() {
            self.is_managed = true;
            if self.t.is_none() {
                self.t = Some(Rc::clone(t));
            }
        }
    }

    fn operand(&self, pos: u8) -> i32 {
        match pos {
            1 => self.v1,
            2 => self.v2,
            3 => self.v3,
            _ => self.v4,
        }
    }

    fn set_operand(&mut self, pos: u8, val: i32) {
        match pos {
            1 => self.v1 = val,
            2 => self.v2 = val,
            3 => self.v3 = val,
            _ => self.v4 = val,
        }
    }

    /// The frame slots this instruction reads: every slot operand except an
    /// assignment destination in `v1`.
    pub fn used_slots(&self) -> SmallVec<[i32; 4]> {
        let mut out = SmallVec::new();
        for &pos in self.op_type.slot_positions() {
            if pos == 1 && self.op.assigns_to_slot1() {
                continue;
            }
            out.push(self.operand(pos));
        }
        out
    }

    pub fn uses_slot(&self, slot: i32) -> bool {
        self.used_slots().contains(&slot)
    }

    /// Rewrites every slot operand through a frame remapping.
    pub fn update_slots(&mut self, frame1_to_frame2: &[i32]) {
        for &pos in self.op_type.slot_positions() {
            let old = self.operand(pos);
            if old >= 0 {
                self.set_operand(pos, frame1_to_frame2[old as usize]);
            }
        }
    }

    /// Writes a concretized branch destination into the integer operand
    /// designated for it.
    pub fn set_branch_operand(&mut self, which_slot: u8, pc: i32) {
        self.set_operand(which_slot, pc);
    }

    pub fn branch_operand(&self, which_slot: u8) -> i32 {
        self.operand(which_slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_ast::{base_type, TypeTag};

    #[test]
    fn used_slots_skip_assignment_destination() {
        let z = Instr::vvv(Op::AddIntVVV, 0, 1, 2);
        assert_eq!(z.used_slots().as_slice(), &[1, 2]);
    }

    #[test]
    fn used_slots_keep_read_v1() {
        // A fused conditional reads its first operand.
        let z = Instr::vv(Op::IfVV, 3, 0);
        assert_eq!(z.used_slots().as_slice(), &[3]);
    }

    #[test]
    fn immediates_are_not_slots() {
        let mut z = Instr::vvv(Op::IndexVecVVi, 0, 1, 7);
        assert_eq!(z.used_slots().as_slice(), &[1]);
        z.update_slots(&[5, 6]);
        assert_eq!((z.v1, z.v2, z.v3), (5, 6, 7));
    }

    #[test]
    fn managed_marking_tracks_type() {
        let mut z = Instr::vv(Op::AssignVV, 0, 1);
        z.check_if_managed(&base_type(TypeTag::Str));
        assert!(z.is_managed);
        let mut w = Instr::vv(Op::AssignVV, 0, 1);
        w.check_if_managed(&base_type(TypeTag::Count));
        assert!(!w.is_managed);
    }
}
