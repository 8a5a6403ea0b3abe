use kestrel_ast::{
    base_type, normalized_tag, BinOp, CallExpr, ConstVal, ConstructElem, ConstructKind, Expr,
    Ident, InIndex, Operand, TypeRef, TypeTag, UnOp,
};
use kestrel_code::{assignment_flavor, AuxItem, Instr, InstrAux, Op};
use kestrel_value::Val;
use smallvec::SmallVec;

use crate::frame::SlotFlavor;
use crate::{CompileError, Generator};

/// Operand-kind shape of a binary expression after const canonicalization.
#[derive(Clone, Copy, PartialEq, Eq)]
enum BinShape {
    VVV,
    VVC,
    VCV,
}

fn generic_binary_op(op: BinOp, shape: BinShape) -> Result<Op, CompileError> {
    use BinShape::*;
    let z = match (op, shape) {
        (BinOp::Add, VVV) => Op::AddVVV,
        (BinOp::Add, VVC) => Op::AddVVC,
        (BinOp::Add, VCV) => Op::AddVCV,
        (BinOp::Sub, VVV) => Op::SubVVV,
        (BinOp::Sub, VVC) => Op::SubVVC,
        (BinOp::Sub, VCV) => Op::SubVCV,
        (BinOp::Mul, VVV) => Op::MulVVV,
        (BinOp::Mul, VVC) => Op::MulVVC,
        (BinOp::Div, VVV) => Op::DivVVV,
        (BinOp::Div, VVC) => Op::DivVVC,
        (BinOp::Div, VCV) => Op::DivVCV,
        (BinOp::Mod, VVV) => Op::ModVVV,
        (BinOp::Mod, VVC) => Op::ModVVC,
        (BinOp::Mod, VCV) => Op::ModVCV,
        (BinOp::Eq, VVV) => Op::EqVVV,
        (BinOp::Eq, VVC) => Op::EqVVC,
        (BinOp::Ne, VVV) => Op::NeVVV,
        (BinOp::Ne, VVC) => Op::NeVVC,
        (BinOp::Lt, VVV) => Op::LtVVV,
        (BinOp::Lt, VVC) => Op::LtVVC,
        (BinOp::Le, VVV) => Op::LeVVV,
        (BinOp::Le, VVC) => Op::LeVVC,
        (BinOp::Gt, VVV) => Op::GtVVV,
        (BinOp::Gt, VVC) => Op::GtVVC,
        (BinOp::Ge, VVV) => Op::GeVVV,
        (BinOp::Ge, VVC) => Op::GeVVC,
        _ => {
            return Err(CompileError::internal(
                "no operand-form variant for binary operator",
            ))
        }
    };
    Ok(z)
}

impl Generator<'_> {
    pub(crate) fn lower_assign_to_name(
        &mut self,
        dest: &Ident,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        match rhs {
            Expr::Name(_) | Expr::Const(_) => {
                let op = rhs_operand(rhs)?;
                self.assign_operand_to(dest, &op)
            }
            Expr::Binary { op, lhs, rhs } => self.lower_binary(dest, *op, lhs, rhs),
            Expr::Unary { op, operand } => self.lower_unary(dest, *op, operand),
            Expr::Coerce { target, operand } => self.lower_coerce(dest, target, operand),
            Expr::Index { aggr, indexes } => self.lower_index(dest, aggr, indexes),
            Expr::Field { record, field } => {
                let rec_slot = self.frame_slot(record)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                let mut z = Instr::vvv(Op::FieldVVi, dest_slot, rec_slot, *field as i32);
                z.t = Some(dest.ty().clone());
                z.check_if_managed(dest.ty());
                self.add_inst(z);
                Ok(())
            }
            Expr::HasField { record, field } => {
                let rec_slot = self.frame_slot(record)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                let z = Instr::vvv(Op::HasFieldVVi, dest_slot, rec_slot, *field as i32);
                self.add_inst(z);
                Ok(())
            }
            Expr::In { item, aggr } => self.lower_in(dest, item, aggr),
            Expr::Size { aggr } => {
                let aggr_slot = self.operand_slot(aggr)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                let mut z = Instr::vv(Op::SizeVV, dest_slot, aggr_slot);
                z.t = Some(aggr.ty().clone());
                self.add_inst(z);
                Ok(())
            }
            Expr::Call(call) => {
                if self.lower_intrinsic(call, Some(dest))? {
                    return Ok(());
                }
                self.do_call(call, Some(dest))
            }
            Expr::Construct { kind, ty, elems } => self.lower_construct(dest, *kind, ty, elems),
        }
    }

    pub(crate) fn assign_operand_to(
        &mut self,
        dest: &Ident,
        op: &Operand,
    ) -> Result<(), CompileError> {
        let mut z = match op {
            Operand::Name(src) => {
                let src_slot = self.frame_slot(src)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vv(Op::AssignVV, dest_slot, src_slot)
            }
            Operand::Const(c) => {
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vc(Op::AssignVC, dest_slot, c.clone())
            }
        };
        z.t = Some(dest.ty().clone());
        z.check_if_managed(dest.ty());
        self.add_inst(z);
        Ok(())
    }

    fn lower_binary(
        &mut self,
        dest: &Ident,
        op: BinOp,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<(), CompileError> {
        if !op.is_relational() && dest.ty().tag() == TypeTag::Vector {
            return self.lower_vec_binary(dest, op, lhs, rhs);
        }

        let operand_tag = lhs.ty().tag();

        // Canonicalize a leading constant: symmetric operators swap it to
        // the right, relationals flip, the rest keep the VCV shape.
        let (op, shape, a, b) = match (lhs, rhs) {
            (Operand::Name(_), Operand::Name(_)) => (op, BinShape::VVV, lhs.clone(), rhs.clone()),
            (Operand::Name(_), Operand::Const(_)) => (op, BinShape::VVC, lhs.clone(), rhs.clone()),
            (Operand::Const(_), Operand::Name(_)) => match op {
                BinOp::Eq | BinOp::Ne => (op, BinShape::VVC, rhs.clone(), lhs.clone()),
                BinOp::Add | BinOp::Mul if operand_tag != TypeTag::Str => {
                    (op, BinShape::VVC, rhs.clone(), lhs.clone())
                }
                _ if op.is_relational() => {
                    (op.flipped(), BinShape::VVC, rhs.clone(), lhs.clone())
                }
                _ => (op, BinShape::VCV, rhs.clone(), lhs.clone()),
            },
            (Operand::Const(_), Operand::Const(_)) => {
                let tmp = self.materialize_const(lhs)?;
                (op, BinShape::VVC, Operand::Name(tmp), rhs.clone())
            }
        };

        let generic = generic_binary_op(op, shape)?;
        let concrete = self.flavored(generic, operand_tag)?;

        // `a` is the slot operand, `b` the second slot or the constant.
        let a_slot = self.operand_slot(&a)?;
        let mut z = match (&b, shape) {
            (Operand::Name(n), _) => {
                let b_slot = self.frame_slot(n)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vvv(concrete, dest_slot, a_slot, b_slot)
            }
            (Operand::Const(c), _) => {
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vvc(concrete, dest_slot, a_slot, c.clone())
            }
        };

        z.t = Some(dest.ty().clone());
        z.check_if_managed(dest.ty());
        self.add_inst(z);
        Ok(())
    }

    fn lower_vec_binary(
        &mut self,
        dest: &Ident,
        op: BinOp,
        lhs: &Operand,
        rhs: &Operand,
    ) -> Result<(), CompileError> {
        let concrete = match op {
            BinOp::Add => Op::AddVecVVV,
            BinOp::Sub => Op::SubVecVVV,
            BinOp::Mul => Op::MulVecVVV,
            BinOp::Div => Op::DivVecVVV,
            _ => {
                return Err(CompileError::internal(
                    "unsupported vectorized operation",
                ))
            }
        };
        let a_slot = self.operand_slot(lhs)?;
        let b_slot = self.operand_slot(rhs)?;
        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
        let mut z = Instr::vvv(concrete, dest_slot, a_slot, b_slot);
        z.t = Some(dest.ty().clone());
        z.check_if_managed(dest.ty());
        self.add_inst(z);
        Ok(())
    }

    fn lower_unary(
        &mut self,
        dest: &Ident,
        op: UnOp,
        operand: &Operand,
    ) -> Result<(), CompileError> {
        let src_slot = self.operand_slot(operand)?;
        let concrete = match op {
            UnOp::Not => Op::NotVV,
            UnOp::Neg => match normalized_tag(dest.ty().tag()) {
                TypeTag::Int => Op::NegIntVV,
                TypeTag::Double => Op::NegDoubleVV,
                TypeTag::Vector => Op::NegVecVV,
                _ => return Err(CompileError::internal("bad type for unary negation")),
            },
        };
        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
        let mut z = Instr::vv(concrete, dest_slot, src_slot);
        z.t = Some(dest.ty().clone());
        z.check_if_managed(dest.ty());
        self.add_inst(z);
        Ok(())
    }

    fn lower_coerce(
        &mut self,
        dest: &Ident,
        target: &TypeRef,
        operand: &Operand,
    ) -> Result<(), CompileError> {
        let dest_tag = normalized_tag(target.tag());
        let src_tag = normalized_tag(operand.ty().tag());

        if dest_tag == TypeTag::Vector || src_tag == TypeTag::Vector {
            if dest_tag != TypeTag::Vector || src_tag != TypeTag::Vector {
                return Err(CompileError::internal(
                    "vector confusion compiling coercion",
                ));
            }
            let d_elem = target
                .yield_type()
                .map(|t| normalized_tag(t.tag()))
                .ok_or_else(|| CompileError::internal("unknown coercion target"))?;
            let s_elem = operand
                .ty()
                .yield_type()
                .map(|t| normalized_tag(t.tag()))
                .ok_or_else(|| CompileError::internal("unknown coercion target"))?;
            let op = match (d_elem, s_elem) {
                (TypeTag::Int, TypeTag::Count) => Op::CoerceVecIUVV,
                (TypeTag::Int, TypeTag::Double) => Op::CoerceVecIDVV,
                (TypeTag::Count, TypeTag::Int) => Op::CoerceVecUIVV,
                (TypeTag::Count, TypeTag::Double) => Op::CoerceVecUDVV,
                (TypeTag::Double, TypeTag::Int) => Op::CoerceVecDIVV,
                (TypeTag::Double, TypeTag::Count) => Op::CoerceVecDUVV,
                _ => return Err(CompileError::internal("unknown coercion target")),
            };
            let src_slot = self.operand_slot(operand)?;
            let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
            let mut z = Instr::vv(op, dest_slot, src_slot);
            z.t = Some(dest.ty().clone());
            z.check_if_managed(dest.ty());
            self.add_inst(z);
            return Ok(());
        }

        let op = match (dest_tag, src_tag) {
            (TypeTag::Int, TypeTag::Count) => Op::CoerceIUVV,
            (TypeTag::Int, TypeTag::Double) => Op::CoerceIDVV,
            (TypeTag::Count, TypeTag::Int) => Op::CoerceUIVV,
            (TypeTag::Count, TypeTag::Double) => Op::CoerceUDVV,
            (TypeTag::Double, TypeTag::Int) => Op::CoerceDIVV,
            (TypeTag::Double, TypeTag::Count) => Op::CoerceDUVV,
            (a, b) if a == b => Op::AssignVV,
            _ => return Err(CompileError::internal("unknown coercion target")),
        };
        let src_slot = self.operand_slot(operand)?;
        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
        let mut z = Instr::vv(op, dest_slot, src_slot);
        z.t = Some(dest.ty().clone());
        z.check_if_managed(dest.ty());
        self.add_inst(z);
        Ok(())
    }

    fn lower_index(
        &mut self,
        dest: &Ident,
        aggr: &Ident,
        indexes: &[Operand],
    ) -> Result<(), CompileError> {
        let aggr_tag = aggr.ty().tag();
        let aggr_slot = self.frame_slot(aggr)?;

        if indexes.len() == 1 {
            let ix = &indexes[0];
            let mut z = match (aggr_tag, ix) {
                (TypeTag::Str, Operand::Name(n)) => {
                    let ix_slot = self.frame_slot(n)?;
                    let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                    Instr::vvv(Op::IndexStringVVV, dest_slot, aggr_slot, ix_slot)
                }
                (TypeTag::Str, Operand::Const(c)) => {
                    let imm = const_index(c)?;
                    let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                    Instr::vvv(Op::IndexStringVVi, dest_slot, aggr_slot, imm)
                }
                (TypeTag::Vector, Operand::Name(n)) => {
                    let ix_slot = self.frame_slot(n)?;
                    let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                    Instr::vvv(Op::IndexVecVVV, dest_slot, aggr_slot, ix_slot)
                }
                (TypeTag::Vector, Operand::Const(c)) => {
                    let imm = const_index(c)?;
                    let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                    Instr::vvv(Op::IndexVecVVi, dest_slot, aggr_slot, imm)
                }
                (TypeTag::Table, Operand::Name(n)) => {
                    let ix_slot = self.frame_slot(n)?;
                    let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                    Instr::vvv(Op::TableIndex1VVV, dest_slot, aggr_slot, ix_slot)
                }
                (TypeTag::Table, Operand::Const(c)) => {
                    let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                    Instr::vvc(Op::TableIndex1VVC, dest_slot, aggr_slot, c.clone())
                }
                _ => {
                    return Err(CompileError::internal(
                        "bad aggregate type when compiling index",
                    ))
                }
            };
            z.t = Some(dest.ty().clone());
            z.check_if_managed(dest.ty());
            self.add_inst(z);
            return Ok(());
        }

        let op = match aggr_tag {
            TypeTag::Vector => Op::IndexVecSliceVVA,
            TypeTag::Table => Op::TableIndexVVA,
            TypeTag::Str => Op::IndexStringSliceVVA,
            _ => {
                return Err(CompileError::internal(
                    "bad aggregate type when compiling index",
                ))
            }
        };

        let aux = self.build_operand_aux(indexes)?;
        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
        let mut z = Instr::vv(op, dest_slot, aggr_slot);
        z.aux = Some(aux);
        z.t = Some(dest.ty().clone());
        z.check_if_managed(dest.ty());
        self.add_inst(z);
        Ok(())
    }

    fn lower_in(
        &mut self,
        dest: &Ident,
        item: &InIndex,
        aggr: &Operand,
    ) -> Result<(), CompileError> {
        let aggr_tag = aggr.ty().tag();

        match aggr_tag {
            TypeTag::Str | TypeTag::Subnet => {
                let InIndex::One(needle) = item else {
                    return Err(CompileError::internal(
                        "bad types when compiling \"in\"",
                    ));
                };
                return self.lower_scalar_in(dest, needle, aggr);
            }
            TypeTag::Vector => {
                let indexes: &[Operand] = match item {
                    InIndex::One(op) => std::slice::from_ref(op),
                    InIndex::List(ops) => ops,
                    InIndex::Two(_, _) => {
                        return Err(CompileError::internal(
                            "bad types when compiling \"in\"",
                        ))
                    }
                };
                let aux = self.build_operand_aux(indexes)?;
                let aggr_slot = self.operand_slot(aggr)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                let mut z = Instr::vv(Op::IndexIsInVectorVVA, dest_slot, aggr_slot);
                z.aux = Some(aux);
                self.add_inst(z);
                return Ok(());
            }
            TypeTag::Table => {}
            _ => {
                return Err(CompileError::internal(
                    "bad types when compiling \"in\"",
                ))
            }
        }

        // Table membership. Single- and double-index forms get dedicated
        // opcodes; longer index lists go through the aux block.
        let item = match item {
            InIndex::List(ops) if ops.len() == 1 => InIndex::One(ops[0].clone()),
            InIndex::List(ops) if ops.len() == 2 => {
                InIndex::Two(ops[0].clone(), ops[1].clone())
            }
            other => other.clone(),
        };

        match &item {
            InIndex::One(Operand::Name(n)) => {
                let item_slot = self.frame_slot(n)?;
                let aggr_slot = self.operand_slot(aggr)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                let mut z = Instr::vvv(Op::ValIsInTableVVV, dest_slot, item_slot, aggr_slot);
                z.t = Some(n.ty().clone());
                self.add_inst(z);
            }
            InIndex::One(Operand::Const(c)) => {
                let aggr_slot = self.operand_slot(aggr)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                let mut z = Instr::vvc(Op::ConstIsInTableVCV, dest_slot, aggr_slot, c.clone());
                z.t = Some(c.ty.clone());
                self.add_inst(z);
            }
            InIndex::Two(a, b) => {
                let aggr_slot = self.operand_slot(aggr)?;
                let mut z = match (a, b) {
                    (Operand::Name(a), Operand::Name(b)) => {
                        let a_slot = self.frame_slot(a)?;
                        let b_slot = self.frame_slot(b)?;
                        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                        let mut z = Instr::vvvv(
                            Op::Val2IsInTableVVVV,
                            dest_slot,
                            a_slot,
                            b_slot,
                            aggr_slot,
                        );
                        z.t = Some(a.ty().clone());
                        z
                    }
                    (Operand::Name(a), Operand::Const(c)) => {
                        let a_slot = self.frame_slot(a)?;
                        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                        let mut z =
                            Instr::vvv(Op::Val2IsInTableVVVC, dest_slot, a_slot, aggr_slot);
                        z.c = Some(c.clone());
                        z.t = Some(a.ty().clone());
                        z
                    }
                    (Operand::Const(c), Operand::Name(b)) => {
                        let b_slot = self.frame_slot(b)?;
                        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                        let mut z =
                            Instr::vvv(Op::Val2IsInTableVVCV, dest_slot, b_slot, aggr_slot);
                        z.c = Some(c.clone());
                        z.t = Some(b.ty().clone());
                        z
                    }
                    (Operand::Const(c0), Operand::Const(c1)) => {
                        let tmp = self.materialize_const(a)?;
                        let tmp_slot = self.frame_slot(&tmp)?;
                        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                        let mut z =
                            Instr::vvv(Op::Val2IsInTableVVVC, dest_slot, tmp_slot, aggr_slot);
                        z.c = Some(c1.clone());
                        z.t = Some(c0.ty.clone());
                        z
                    }
                };
                self.add_inst(z);
            }
            InIndex::List(ops) => {
                let aux = self.build_operand_aux(ops)?;
                let aggr_slot = self.operand_slot(aggr)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                let mut z = Instr::vv(Op::ListIsInTableVVA, dest_slot, aggr_slot);
                z.aux = Some(aux);
                self.add_inst(z);
            }
        }
        Ok(())
    }

    /// `p in s`, `s1 in s2`, `a in net`: all share the three operand-kind
    /// forms.
    fn lower_scalar_in(
        &mut self,
        dest: &Ident,
        needle: &Operand,
        aggr: &Operand,
    ) -> Result<(), CompileError> {
        let family = match (needle.ty().tag(), aggr.ty().tag()) {
            (TypeTag::Pattern, TypeTag::Str) => {
                [Op::PatInStrVVV, Op::PatInStrVVC, Op::PatInStrVCV]
            }
            (TypeTag::Str, TypeTag::Str) => [Op::StrInStrVVV, Op::StrInStrVVC, Op::StrInStrVCV],
            (TypeTag::Addr, TypeTag::Subnet) => {
                [Op::AddrInSubnetVVV, Op::AddrInSubnetVVC, Op::AddrInSubnetVCV]
            }
            _ => {
                return Err(CompileError::internal(
                    "bad types when compiling \"in\"",
                ))
            }
        };

        let mut z = match (needle, aggr) {
            (Operand::Name(n), Operand::Name(h)) => {
                let n_slot = self.frame_slot(n)?;
                let h_slot = self.frame_slot(h)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vvv(family[0], dest_slot, n_slot, h_slot)
            }
            (Operand::Name(n), Operand::Const(c)) => {
                let n_slot = self.frame_slot(n)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vvc(family[1], dest_slot, n_slot, c.clone())
            }
            (Operand::Const(c), Operand::Name(h)) => {
                let h_slot = self.frame_slot(h)?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vvc(family[2], dest_slot, h_slot, c.clone())
            }
            (Operand::Const(_), Operand::Const(_)) => {
                let tmp = self.materialize_const(needle)?;
                let n_slot = self.frame_slot(&tmp)?;
                let c = aggr.as_const().cloned().ok_or_else(|| {
                    CompileError::internal("constant operand expected")
                })?;
                let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
                Instr::vvc(family[1], dest_slot, n_slot, c)
            }
        };
        z.t = Some(needle.ty().clone());
        self.add_inst(z);
        Ok(())
    }

    fn lower_construct(
        &mut self,
        dest: &Ident,
        kind: ConstructKind,
        ty: &TypeRef,
        elems: &[ConstructElem],
    ) -> Result<(), CompileError> {
        let op = match kind {
            ConstructKind::Table => Op::ConstructTableVA,
            ConstructKind::Set => Op::ConstructSetVA,
            ConstructKind::Record => Op::ConstructRecordVA,
            ConstructKind::Vector => Op::ConstructVectorVA,
        };

        let mut items: SmallVec<[AuxItem; 4]> = SmallVec::new();
        for elem in elems {
            match elem {
                ConstructElem::Positional(op) => items.push(self.operand_aux_item(op)?),
                ConstructElem::Keyed { indexes, val } => {
                    for ix in indexes {
                        items.push(self.operand_aux_item(ix)?);
                    }
                    items.push(self.operand_aux_item(val)?);
                }
            }
        }

        let dest_slot = self.frame1_slot(dest, SlotFlavor::Write)?;
        let mut z = Instr::v(op, dest_slot);
        z.aux = Some(InstrAux::with_items(items));
        z.t = Some(ty.clone());
        z.check_if_managed(ty);
        self.add_inst(z);
        Ok(())
    }

    // ---- calls ----------------------------------------------------------

    pub(crate) fn do_call(
        &mut self,
        call: &CallExpr,
        dest: Option<&Ident>,
    ) -> Result<(), CompileError> {
        self.sync_globals();

        let indirect = !call.callee.is_global();
        let nargs = call.args.len();

        let mut z;
        if !indirect && nargs == 0 {
            z = match dest {
                Some(n) => {
                    let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                    Instr::v(Op::AssignCall0V, n_slot)
                }
                None => Instr::new(Op::Call0X),
            };
        } else if !indirect && nargs == 1 {
            let arg0 = &call.args[0];
            z = match (dest, arg0) {
                (Some(n), Operand::Name(a)) => {
                    let a_slot = self.frame_slot(a)?;
                    let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                    Instr::vv(Op::AssignCall1VV, n_slot, a_slot)
                }
                (Some(n), Operand::Const(c)) => {
                    let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                    Instr::vc(Op::AssignCall1VC, n_slot, c.clone())
                }
                (None, Operand::Name(a)) => {
                    let a_slot = self.frame_slot(a)?;
                    Instr::v(Op::Call1V, a_slot)
                }
                (None, Operand::Const(c)) => {
                    let mut z = Instr::new(Op::Call1C);
                    z.c = Some(c.clone());
                    z
                }
            };
            z.t = Some(arg0.ty().clone());
        } else {
            let aux = self.build_operand_aux(&call.args)?;

            if indirect {
                let callee_slot = self.frame_slot(&call.callee)?;
                z = match dest {
                    Some(n) => {
                        let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                        Instr::vv(Op::AssignIndCallNVVA, n_slot, callee_slot)
                    }
                    None => Instr::v(Op::IndCallNVA, callee_slot),
                };
            } else {
                let op = match (nargs, dest.is_some()) {
                    (2, false) => Op::Call2A,
                    (2, true) => Op::AssignCall2VA,
                    (3, false) => Op::Call3A,
                    (3, true) => Op::AssignCall3VA,
                    (4, false) => Op::Call4A,
                    (4, true) => Op::AssignCall4VA,
                    (5, false) => Op::Call5A,
                    (5, true) => Op::AssignCall5VA,
                    (_, false) => Op::CallNA,
                    (_, true) => Op::AssignCallNVA,
                };
                z = match dest {
                    Some(n) => {
                        let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                        Instr::v(op, n_slot)
                    }
                    None => Instr::new(op),
                };
            }
            z.aux = Some(aux);
        }

        if !indirect {
            z.callee = Some(call.callee.clone());
        }
        if let Some(n) = dest {
            z.check_if_managed(n.ty());
        }

        self.add_inst(z);
        Ok(())
    }

    /// Recognizes built-in callees by name and lowers them to intrinsic
    /// opcodes. Returns whether the call was handled.
    pub(crate) fn lower_intrinsic(
        &mut self,
        call: &CallExpr,
        dest: Option<&Ident>,
    ) -> Result<bool, CompileError> {
        if !call.callee.is_global() {
            return Ok(false);
        }

        match call.callee.name() {
            "to_lower" => {
                let Some(n) = dest else {
                    return self.discard_builtin_result();
                };
                let Some(Operand::Name(arg)) = call.args.first() else {
                    return Ok(false);
                };
                let arg_slot = self.frame_slot(arg)?;
                let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                let mut z = Instr::vv(Op::ToLowerVV, n_slot, arg_slot);
                z.check_if_managed(n.ty());
                self.add_inst(z);
                Ok(true)
            }
            "sub_bytes" => {
                let Some(n) = dest else {
                    return self.discard_builtin_result();
                };
                if call.args.len() != 3 {
                    return Ok(false);
                }
                let Operand::Name(s) = &call.args[0] else {
                    return Ok(false);
                };
                let s_slot = self.frame_slot(s)?;
                let start_slot = self.operand_slot(&call.args[1])?;
                let n_count_slot = self.operand_slot(&call.args[2])?;
                let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                let mut z =
                    Instr::vvvv(Op::SubBytesVVVV, n_slot, s_slot, start_slot, n_count_slot);
                z.check_if_managed(n.ty());
                self.add_inst(z);
                Ok(true)
            }
            "strstr" => {
                let Some(n) = dest else {
                    return self.discard_builtin_result();
                };
                if call.args.len() != 2 {
                    return Ok(false);
                }
                let big = &call.args[0];
                let little = &call.args[1];
                let mut z = match (big, little) {
                    (Operand::Name(b), Operand::Name(l)) => {
                        let b_slot = self.frame_slot(b)?;
                        let l_slot = self.frame_slot(l)?;
                        let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                        Instr::vvv(Op::StrStrVVV, n_slot, b_slot, l_slot)
                    }
                    (Operand::Name(b), Operand::Const(c)) => {
                        let b_slot = self.frame_slot(b)?;
                        let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                        Instr::vvc(Op::StrStrVVC, n_slot, b_slot, c.clone())
                    }
                    (Operand::Const(c), Operand::Name(l)) => {
                        let l_slot = self.frame_slot(l)?;
                        let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                        Instr::vvc(Op::StrStrVCV, n_slot, l_slot, c.clone())
                    }
                    (Operand::Const(_), Operand::Const(_)) => return Ok(false),
                };
                z.t = None;
                self.add_inst(z);
                Ok(true)
            }
            "Log::write" => {
                if call.args.len() != 2 {
                    return Ok(false);
                }
                let Operand::Name(columns) = &call.args[1] else {
                    return Ok(false);
                };
                let stream_slot = self.operand_slot(&call.args[0])?;
                let col_slot = self.frame_slot(columns)?;
                let mut z = match dest {
                    Some(n) => {
                        let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                        Instr::vvv(Op::LogWriteVVV, n_slot, stream_slot, col_slot)
                    }
                    None => Instr::vv(Op::LogWriteVV, stream_slot, col_slot),
                };
                z.t = Some(columns.ty().clone());
                self.add_inst(z);
                Ok(true)
            }
            "Log::flush" => {
                let z = match dest {
                    Some(n) => {
                        let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                        Instr::v(Op::LogFlushV, n_slot)
                    }
                    None => Instr::new(Op::LogFlushX),
                };
                self.add_inst(z);
                Ok(true)
            }
            "get_port_transport_proto" => {
                let Some(n) = dest else {
                    return self.discard_builtin_result();
                };
                let Some(Operand::Name(p)) = call.args.first() else {
                    return Ok(false);
                };
                let p_slot = self.frame_slot(p)?;
                let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                self.add_inst(Instr::vv(Op::PortProtoVV, n_slot, p_slot));
                Ok(true)
            }
            "reading_live_traffic" => {
                let Some(n) = dest else {
                    return self.discard_builtin_result();
                };
                let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                self.add_inst(Instr::v(Op::ReadingLiveTrafficV, n_slot));
                Ok(true)
            }
            "reading_traces" => {
                let Some(n) = dest else {
                    return self.discard_builtin_result();
                };
                let n_slot = self.frame1_slot(n, SlotFlavor::Write)?;
                self.add_inst(Instr::v(Op::ReadingTracesV, n_slot));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn discard_builtin_result(&mut self) -> Result<bool, CompileError> {
        self.warnings
            .push("return value from built-in function ignored".to_string());
        Ok(true)
    }

    // ---- element assignment --------------------------------------------

    pub(crate) fn assign_vec_elems(
        &mut self,
        aggr: &Ident,
        indexes: &[Operand],
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let rhs_op = rhs_operand(rhs)?;

        if indexes.len() > 1 {
            let src_slot = self.operand_slot(&rhs_op)?;
            let aux = self.build_operand_aux(indexes)?;
            let vec_slot = self.frame1_slot(aggr, SlotFlavor::ReadWrite)?;
            let mut z = Instr::vv(Op::VectorSliceAssignVVA, vec_slot, src_slot);
            z.aux = Some(aux);
            z.t = Some(rhs_op.ty().clone());
            self.add_inst(z);
            return Ok(());
        }

        let ix = &indexes[0];
        let mut z = match (ix, &rhs_op) {
            (Operand::Name(i), Operand::Name(s)) => {
                let i_slot = self.frame_slot(i)?;
                let s_slot = self.frame_slot(s)?;
                let vec_slot = self.frame1_slot(aggr, SlotFlavor::ReadWrite)?;
                Instr::vvv(Op::VectorElemAssignVVV, vec_slot, i_slot, s_slot)
            }
            (Operand::Name(i), Operand::Const(c)) => {
                let i_slot = self.frame_slot(i)?;
                let vec_slot = self.frame1_slot(aggr, SlotFlavor::ReadWrite)?;
                Instr::vvc(Op::VectorElemAssignVVC, vec_slot, i_slot, c.clone())
            }
            (Operand::Const(c), Operand::Name(s)) => {
                let imm = const_index(c)?;
                let s_slot = self.frame_slot(s)?;
                let vec_slot = self.frame1_slot(aggr, SlotFlavor::ReadWrite)?;
                Instr::vvv(Op::VectorElemAssignVVi, vec_slot, s_slot, imm)
            }
            (Operand::Const(_), Operand::Const(c_src)) => {
                let tmp = self.materialize_const(ix)?;
                let i_slot = self.frame_slot(&tmp)?;
                let vec_slot = self.frame1_slot(aggr, SlotFlavor::ReadWrite)?;
                Instr::vvc(Op::VectorElemAssignVVC, vec_slot, i_slot, c_src.clone())
            }
        };
        z.t = Some(rhs_op.ty().clone());
        self.add_inst(z);
        Ok(())
    }

    pub(crate) fn assign_table_elem(
        &mut self,
        aggr: &Ident,
        indexes: &[Operand],
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let rhs_op = rhs_operand(rhs)?;
        let aux = self.build_operand_aux(indexes)?;

        let mut z = match &rhs_op {
            Operand::Name(s) => {
                let s_slot = self.frame_slot(s)?;
                let tbl_slot = self.frame1_slot(aggr, SlotFlavor::ReadWrite)?;
                Instr::vv(Op::TableElemAssignVVA, tbl_slot, s_slot)
            }
            Operand::Const(c) => {
                let tbl_slot = self.frame1_slot(aggr, SlotFlavor::ReadWrite)?;
                let mut z = Instr::v(Op::TableElemAssignVCA, tbl_slot);
                z.c = Some(c.clone());
                z
            }
        };
        z.aux = Some(aux);
        z.t = Some(rhs_op.ty().clone());
        self.add_inst(z);
        Ok(())
    }

    pub(crate) fn assign_field(
        &mut self,
        record: &Ident,
        field: usize,
        rhs: &Expr,
    ) -> Result<(), CompileError> {
        let rhs_op = rhs_operand(rhs)?;
        let z = match &rhs_op {
            Operand::Name(s) => {
                let s_slot = self.frame_slot(s)?;
                let rec_slot = self.frame1_slot(record, SlotFlavor::ReadWrite)?;
                Instr::vvv(Op::FieldAssignVVi, rec_slot, s_slot, field as i32)
            }
            Operand::Const(c) => {
                let rec_slot = self.frame1_slot(record, SlotFlavor::ReadWrite)?;
                let mut z = Instr::vv(Op::FieldAssignVCi, rec_slot, field as i32);
                z.c = Some(c.clone());
                z
            }
        };
        self.add_inst(z);
        Ok(())
    }

    // ---- conditionals ---------------------------------------------------

    /// Lowers a conditional expression to a fused predicate-branch when one
    /// exists, otherwise to a value in a temporary plus a plain branch.
    /// Returns the instruction index and the operand slot its branch target
    /// goes into.
    pub(crate) fn gen_cond(&mut self, e: &Expr) -> Result<(usize, u8), CompileError> {
        match e {
            Expr::HasField { record, field } => {
                let rec_slot = self.frame_slot(record)?;
                let z = Instr::vvv(Op::HasFieldCondVVV, rec_slot, *field as i32, 0);
                Ok((self.add_inst(z), 3))
            }
            Expr::In {
                item: InIndex::One(needle),
                aggr,
            } if aggr.ty().tag() == TypeTag::Table => match needle {
                Operand::Name(n) => {
                    let item_slot = self.frame_slot(n)?;
                    let aggr_slot = self.operand_slot(aggr)?;
                    let mut z =
                        Instr::vvv(Op::ValIsInTableCondVVV, item_slot, aggr_slot, 0);
                    z.t = Some(n.ty().clone());
                    Ok((self.add_inst(z), 3))
                }
                Operand::Const(c) => {
                    let aggr_slot = self.operand_slot(aggr)?;
                    let mut z = Instr::vv(Op::ConstIsInTableCondVVC, aggr_slot, 0);
                    z.c = Some(c.clone());
                    z.t = Some(c.ty.clone());
                    Ok((self.add_inst(z), 2))
                }
            },
            _ => {
                let tmp = self.new_temp(base_type(TypeTag::Bool));
                self.lower_assign_to_name(&tmp, e)?;
                let tmp_slot = self.frame_slot(&tmp)?;
                let idx = self.add_inst(Instr::vv(Op::IfVV, tmp_slot, 0));
                Ok((idx, 2))
            }
        }
    }

    // ---- operand helpers ------------------------------------------------

    /// The frame slot holding an operand's value, materializing constants
    /// into a fresh temporary.
    pub(crate) fn operand_slot(&mut self, op: &Operand) -> Result<i32, CompileError> {
        match op {
            Operand::Name(n) => self.frame_slot(n),
            Operand::Const(_) => {
                let tmp = self.materialize_const(op)?;
                self.frame_slot(&tmp)
            }
        }
    }

    /// Parks a constant in a compiler temporary and returns its identifier.
    fn materialize_const(&mut self, op: &Operand) -> Result<Ident, CompileError> {
        let c = op
            .as_const()
            .ok_or_else(|| CompileError::internal("constant operand expected"))?
            .clone();
        let tmp = self.new_temp(c.ty.clone());
        let tmp_slot = self.frame_slot(&tmp)?;
        let mut z = Instr::vc(Op::AssignVC, tmp_slot, c.clone());
        z.t = Some(c.ty.clone());
        z.check_if_managed(&c.ty);
        self.add_inst(z);
        Ok(tmp)
    }

    /// A compiler-internal identifier with a real type, registered in the
    /// frame.
    pub(crate) fn new_temp(&mut self, ty: TypeRef) -> Ident {
        let name = format!("#internal-{}#", self.frame_denizens.len());
        let id = Ident::new(name, ty, kestrel_ast::IdScope::Local, 0);
        self.add_to_frame(&id);
        id
    }

    pub(crate) fn operand_aux_item(&mut self, op: &Operand) -> Result<AuxItem, CompileError> {
        match op {
            Operand::Name(n) => {
                let slot = self.frame_slot(n)?;
                Ok(AuxItem::slot(slot, n.ty().clone()))
            }
            Operand::Const(c) => Ok(AuxItem::constant(c.clone())),
        }
    }

    pub(crate) fn build_operand_aux(
        &mut self,
        ops: &[Operand],
    ) -> Result<Box<InstrAux>, CompileError> {
        let mut items: SmallVec<[AuxItem; 4]> = SmallVec::with_capacity(ops.len());
        for op in ops {
            items.push(self.operand_aux_item(op)?);
        }
        Ok(InstrAux::with_items(items))
    }

    pub(crate) fn flavored(&self, generic: Op, tag: TypeTag) -> Result<Op, CompileError> {
        assignment_flavor(generic, tag).ok_or_else(|| {
            CompileError::internal(format!(
                "no assignment flavor for {} with tag {tag:?}",
                generic.name()
            ))
        })
    }
}

pub(crate) fn rhs_operand(e: &Expr) -> Result<Operand, CompileError> {
    match e {
        Expr::Name(n) => Ok(Operand::Name(n.clone())),
        Expr::Const(c) => Ok(Operand::Const(c.clone())),
        _ => Err(CompileError::internal(
            "operand expected in reduced expression",
        )),
    }
}

fn const_index(c: &ConstVal) -> Result<i32, CompileError> {
    let imm = match &c.val {
        Val::Count(n) => *n as i64,
        Val::Int(n) => *n,
        _ => return Err(CompileError::internal("bad constant index")),
    };
    i32::try_from(imm).map_err(|_| CompileError::internal("constant index out of range"))
}
