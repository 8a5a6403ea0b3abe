use kestrel_ast::{base_type, IdScope, Ident, TypeTag};
use kestrel_code::{Instr, Op};

use crate::{CompileError, Generator};

/// How an instruction touches the identifier behind its first operand.
/// Globals are loaded before reads and marked dirty after writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotFlavor {
    Read,
    Write,
    ReadWrite,
    Internal,
}

impl<'a> Generator<'a> {
    pub(crate) fn add_to_frame(&mut self, id: &Ident) -> usize {
        let slot = self.frame_denizens.len();
        self.frame_layout1.insert(id.clone(), slot);
        self.frame_denizens.push(id.clone());
        slot
    }

    pub(crate) fn has_frame_slot(&self, id: &Ident) -> bool {
        self.frame_layout1.contains_key(id)
    }

    pub(crate) fn raw_slot(&self, id: &Ident) -> Result<usize, CompileError> {
        self.frame_layout1.get(id).copied().ok_or_else(|| {
            CompileError::internal(format!("identifier {id} missing from frame layout"))
        })
    }

    /// Slot for a read access; emits a global load first when needed.
    pub(crate) fn frame_slot(&mut self, id: &Ident) -> Result<i32, CompileError> {
        let slot = self.raw_slot(id)?;
        if id.is_global() {
            self.load_global(id)?;
        }
        Ok(slot as i32)
    }

    /// Slot for an instruction's first operand, honoring the opcode's
    /// access flavor.
    pub(crate) fn frame1_slot(
        &mut self,
        id: &Ident,
        flavor: SlotFlavor,
    ) -> Result<i32, CompileError> {
        let slot = self.raw_slot(id)?;

        match flavor {
            SlotFlavor::Read => {
                if id.is_global() {
                    self.load_global(id)?;
                }
            }
            SlotFlavor::Write => {
                if id.is_global() {
                    self.mark_global_dirty(id);
                }
            }
            SlotFlavor::ReadWrite => {
                if id.is_global() {
                    self.load_global(id)?;
                    self.mark_global_dirty(id);
                }
            }
            SlotFlavor::Internal => {}
        }

        Ok(slot as i32)
    }

    fn mark_global_dirty(&mut self, id: &Ident) {
        if let Some(&info) = self.global_id_to_info.get(id) {
            self.mark_dirty = Some(info);
            self.modified_globals.insert(id.clone());
        }
    }

    /// Reads the current process value of a global into its frame slot.
    /// Redundant loads are no-ops at run time; unused ones are pruned.
    pub(crate) fn load_global(&mut self, id: &Ident) -> Result<(), CompileError> {
        let slot = self.raw_slot(id)? as i32;
        let info = *self
            .global_id_to_info
            .get(id)
            .ok_or_else(|| CompileError::internal(format!("{id} missing from globals table")))?;

        let mut z = Instr::vv(Op::LoadGlobalVC, slot, info as i32);
        z.t = Some(id.ty().clone());
        self.add_inst(z);
        Ok(())
    }

    pub(crate) fn load_param(&mut self, id: &Ident) {
        let slot = self.add_to_frame(id);
        let mut z = Instr::vv(Op::LoadValVV, slot as i32, id.offset() as i32);
        z.t = Some(id.ty().clone());
        self.add_inst(z);
    }

    /// Materializes a local's frame value into the interpreter frame, for
    /// expressions the host evaluates on our behalf.
    pub(crate) fn store_local(&mut self, id: &Ident) -> Result<(), CompileError> {
        self.interpreter_locals.insert(id.clone());
        let slot = self.raw_slot(id)? as i32;
        let mut z = Instr::vv(Op::StoreValVV, slot, id.offset() as i32);
        z.t = Some(id.ty().clone());
        self.add_inst(z);
        Ok(())
    }

    /// Allocates a compiler-internal temporary slot. All that matters for
    /// the frame analysis is whether the slot is managed.
    pub(crate) fn new_slot(&mut self, is_managed: bool) -> i32 {
        let name = format!("#internal-{}#", self.frame_denizens.len());
        let tag = if is_managed {
            TypeTag::Table
        } else {
            TypeTag::Void
        };
        let id = Ident::new(name, base_type(tag), IdScope::Local, 0);
        self.add_to_frame(&id) as i32
    }

    /// Flushes dirty globals back to the process before an externally
    /// visible event, if any global might have been written by this point.
    pub(crate) fn sync_globals(&mut self) {
        if self.modified_globals.is_empty() {
            return;
        }
        self.add_inst(Instr::new(Op::SyncGlobalsX));
    }

}
