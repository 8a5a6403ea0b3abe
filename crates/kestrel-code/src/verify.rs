use std::fmt;

use crate::{CompiledBody, Op};

/// A structural inconsistency in a compiled body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyError {
    pub message: String,
}

impl VerifyError {
    fn new(message: impl Into<String>) -> VerifyError {
        VerifyError {
            message: message.into(),
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "compiled body verification error: {}", self.message)
    }
}

impl std::error::Error for VerifyError {}

/// Checks the invariants the optimizer is supposed to establish: every
/// branch operand of the final stream lands inside (or one past) the stream,
/// every first-pass branch points at a live instruction or the end, and
/// switch-table entries land in bounds.
pub fn verify_body(body: &CompiledBody) -> Result<(), VerifyError> {
    let len1 = body.insts1.len();
    for (i, z) in body.insts1.iter().enumerate() {
        if !z.live {
            continue;
        }
        for (label, which) in [(z.target, z.target_slot), (z.target2, z.target2_slot)] {
            let Some(label) = label else { continue };
            if label.0 > len1 {
                return Err(VerifyError::new(format!(
                    "instruction {i} branches out of range ({})",
                    label.0
                )));
            }
            if label.0 < len1 && !body.insts1[label.0].live {
                return Err(VerifyError::new(format!(
                    "instruction {i} branches to dead instruction {}",
                    label.0
                )));
            }
            if which == 0 || which > 4 {
                return Err(VerifyError::new(format!(
                    "instruction {i} has no operand slot for its branch"
                )));
            }
        }
    }

    let len2 = body.insts2.len();
    for (i, z) in body.insts2.iter().enumerate() {
        if z.inst_num != i {
            return Err(VerifyError::new(format!(
                "instruction {i} carries stale number {}",
                z.inst_num
            )));
        }
        if z.target.is_some() {
            let pc = z.branch_operand(z.target_slot);
            if pc < 0 || pc as usize > len2 {
                return Err(VerifyError::new(format!(
                    "instruction {i} has unconcretized branch operand {pc}"
                )));
            }
        }
        if z.target2.is_some() {
            let pc = z.branch_operand(z.target2_slot);
            if pc < 0 || pc as usize > len2 {
                return Err(VerifyError::new(format!(
                    "instruction {i} has unconcretized secondary branch operand {pc}"
                )));
            }
        }
        if matches!(
            z.op,
            Op::SwitchIntVVV | Op::SwitchCountVVV | Op::SwitchDoubleVVV | Op::SwitchStrVVV
        ) {
            let tbl = z.v2 as usize;
            let in_range = match z.op {
                Op::SwitchIntVVV => tbl < body.cases.int_cases.len(),
                Op::SwitchCountVVV => tbl < body.cases.uint_cases.len(),
                Op::SwitchDoubleVVV => tbl < body.cases.double_cases.len(),
                _ => tbl < body.cases.str_cases.len(),
            };
            if !in_range {
                return Err(VerifyError::new(format!(
                    "instruction {i} names switch table {tbl} which does not exist"
                )));
            }
        }
    }

    let check_pcs = |pcs: &mut dyn Iterator<Item = u32>| -> Result<(), VerifyError> {
        for pc in pcs {
            if pc as usize > len2 {
                return Err(VerifyError::new(format!(
                    "switch table entry branches out of range ({pc})"
                )));
            }
        }
        Ok(())
    };
    check_pcs(&mut body.cases.int_cases.iter().flatten().map(|(_, pc)| *pc))?;
    check_pcs(&mut body.cases.uint_cases.iter().flatten().map(|(_, pc)| *pc))?;
    check_pcs(&mut body.cases.double_cases.iter().flatten().map(|(_, pc)| *pc))?;
    check_pcs(&mut body.cases.str_cases.iter().flatten().map(|(_, pc)| *pc))?;

    Ok(())
}
