use std::sync::OnceLock;

use kestrel_ast::{normalized_tag, TypeTag};
use rustc_hash::FxHashMap;

use crate::OperandForm;

macro_rules! define_ops {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// The opcode of one instruction. The suffix encodes the canonical
        /// operand layout: `V` a frame slot, `C` the embedded constant,
        /// `A` the aux block, `i` an immediate integer operand.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum Op {
            $($variant),+
        }

        impl Op {
            pub const ALL: &'static [Op] = &[$(Op::$variant),+];

            /// The dump mnemonic.
            pub fn name(self) -> &'static str {
                match self {
                    $(Op::$variant => $name),+
                }
            }

            /// Inverse of [`Op::name`], for tools that re-read dumps.
            pub fn from_name(s: &str) -> Option<Op> {
                match s {
                    $($name => Some(Op::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

define_ops! {
    Nop => "nop",

    // Moves and constant loads.
    AssignVV => "assign_vv",
    AssignVC => "assign_vc",

    // Interpreter-frame traffic and globals.
    LoadValVV => "load_val_vv",
    StoreValVV => "store_val_vv",
    LoadGlobalVC => "load_global_vc",
    DirtyGlobalV => "dirty_global_v",
    SyncGlobalsX => "sync_globals_x",

    // Control.
    GotoV => "goto_v",
    IfVV => "if_vv",
    IfNotVV => "if_not_vv",
    IfElseVV => "if_else_vv",
    HasFieldCondVVV => "has_field_cond_vvv",
    NotHasFieldCondVVV => "not_has_field_cond_vvv",
    ValIsInTableCondVVV => "val_is_in_table_cond_vvv",
    ValIsNotInTableCondVVV => "val_is_not_in_table_cond_vvv",
    ConstIsInTableCondVVC => "const_is_in_table_cond_vvc",
    ConstIsNotInTableCondVVC => "const_is_not_in_table_cond_vvc",
    SwitchIntVVV => "switch_int_vvv",
    SwitchCountVVV => "switch_count_vvv",
    SwitchDoubleVVV => "switch_double_vvv",
    SwitchStrVVV => "switch_str_vvv",
    ReturnV => "return_v",
    ReturnC => "return_c",
    ReturnX => "return_x",
    HookBreakX => "hook_break_x",
    WhenVV => "when_vv",
    WhenTimeoutVVVC => "when_timeout_vvvc",
    WhenTimeoutVVVV => "when_timeout_vvvv",

    // Generic arithmetic, resolved through the assignment-flavor table
    // before emission; these never reach the engine.
    AddVVV => "add_vvv",
    AddVVC => "add_vvc",
    AddVCV => "add_vcv",
    SubVVV => "sub_vvv",
    SubVVC => "sub_vvc",
    SubVCV => "sub_vcv",
    MulVVV => "mul_vvv",
    MulVVC => "mul_vvc",
    DivVVV => "div_vvv",
    DivVVC => "div_vvc",
    DivVCV => "div_vcv",
    ModVVV => "mod_vvv",
    ModVVC => "mod_vvc",
    ModVCV => "mod_vcv",
    EqVVV => "eq_vvv",
    EqVVC => "eq_vvc",
    NeVVV => "ne_vvv",
    NeVVC => "ne_vvc",
    LtVVV => "lt_vvv",
    LtVVC => "lt_vvc",
    LeVVV => "le_vvv",
    LeVVC => "le_vvc",
    GtVVV => "gt_vvv",
    GtVVC => "gt_vvc",
    GeVVV => "ge_vvv",
    GeVVC => "ge_vvc",

    // Int arithmetic.
    AddIntVVV => "add_int_vvv",
    AddIntVVC => "add_int_vvc",
    SubIntVVV => "sub_int_vvv",
    SubIntVVC => "sub_int_vvc",
    SubIntVCV => "sub_int_vcv",
    MulIntVVV => "mul_int_vvv",
    MulIntVVC => "mul_int_vvc",
    DivIntVVV => "div_int_vvv",
    DivIntVVC => "div_int_vvc",
    DivIntVCV => "div_int_vcv",
    ModIntVVV => "mod_int_vvv",
    ModIntVVC => "mod_int_vvc",
    ModIntVCV => "mod_int_vcv",

    // Count arithmetic.
    AddCountVVV => "add_count_vvv",
    AddCountVVC => "add_count_vvc",
    SubCountVVV => "sub_count_vvv",
    SubCountVVC => "sub_count_vvc",
    SubCountVCV => "sub_count_vcv",
    MulCountVVV => "mul_count_vvv",
    MulCountVVC => "mul_count_vvc",
    DivCountVVV => "div_count_vvv",
    DivCountVVC => "div_count_vvc",
    DivCountVCV => "div_count_vcv",
    ModCountVVV => "mod_count_vvv",
    ModCountVVC => "mod_count_vvc",
    ModCountVCV => "mod_count_vcv",

    // Double arithmetic.
    AddDoubleVVV => "add_double_vvv",
    AddDoubleVVC => "add_double_vvc",
    SubDoubleVVV => "sub_double_vvv",
    SubDoubleVVC => "sub_double_vvc",
    SubDoubleVCV => "sub_double_vcv",
    MulDoubleVVV => "mul_double_vvv",
    MulDoubleVVC => "mul_double_vvc",
    DivDoubleVVV => "div_double_vvv",
    DivDoubleVVC => "div_double_vvc",
    DivDoubleVCV => "div_double_vcv",

    // String concatenation.
    AddStrVVV => "add_str_vvv",
    AddStrVVC => "add_str_vvc",
    AddStrVCV => "add_str_vcv",

    // Unary.
    NegIntVV => "neg_int_vv",
    NegDoubleVV => "neg_double_vv",
    NotVV => "not_vv",

    // Comparisons; the destination receives a bool.
    EqIntVVV => "eq_int_vvv",
    EqIntVVC => "eq_int_vvc",
    NeIntVVV => "ne_int_vvv",
    NeIntVVC => "ne_int_vvc",
    LtIntVVV => "lt_int_vvv",
    LtIntVVC => "lt_int_vvc",
    LeIntVVV => "le_int_vvv",
    LeIntVVC => "le_int_vvc",
    GtIntVVV => "gt_int_vvv",
    GtIntVVC => "gt_int_vvc",
    GeIntVVV => "ge_int_vvv",
    GeIntVVC => "ge_int_vvc",
    EqCountVVV => "eq_count_vvv",
    EqCountVVC => "eq_count_vvc",
    NeCountVVV => "ne_count_vvv",
    NeCountVVC => "ne_count_vvc",
    LtCountVVV => "lt_count_vvv",
    LtCountVVC => "lt_count_vvc",
    LeCountVVV => "le_count_vvv",
    LeCountVVC => "le_count_vvc",
    GtCountVVV => "gt_count_vvv",
    GtCountVVC => "gt_count_vvc",
    GeCountVVV => "ge_count_vvv",
    GeCountVVC => "ge_count_vvc",
    EqDoubleVVV => "eq_double_vvv",
    EqDoubleVVC => "eq_double_vvc",
    NeDoubleVVV => "ne_double_vvv",
    NeDoubleVVC => "ne_double_vvc",
    LtDoubleVVV => "lt_double_vvv",
    LtDoubleVVC => "lt_double_vvc",
    LeDoubleVVV => "le_double_vvv",
    LeDoubleVVC => "le_double_vvc",
    GtDoubleVVV => "gt_double_vvv",
    GtDoubleVVC => "gt_double_vvc",
    GeDoubleVVV => "ge_double_vvv",
    GeDoubleVVC => "ge_double_vvc",
    EqStrVVV => "eq_str_vvv",
    EqStrVVC => "eq_str_vvc",
    NeStrVVV => "ne_str_vvv",
    NeStrVVC => "ne_str_vvc",
    LtStrVVV => "lt_str_vvv",
    LtStrVVC => "lt_str_vvc",
    LeStrVVV => "le_str_vvv",
    LeStrVVC => "le_str_vvc",
    GtStrVVV => "gt_str_vvv",
    GtStrVVC => "gt_str_vvc",
    GeStrVVV => "ge_str_vvv",
    GeStrVVC => "ge_str_vvc",
    EqAddrVVV => "eq_addr_vvv",
    NeAddrVVV => "ne_addr_vvv",

    // Vectorized arithmetic; the element tag comes from the operand type.
    AddVecVVV => "add_vec_vvv",
    SubVecVVV => "sub_vec_vvv",
    MulVecVVV => "mul_vec_vvv",
    DivVecVVV => "div_vec_vvv",
    NegVecVV => "neg_vec_vv",

    // Scalar coercions, destination tag first.
    CoerceIUVV => "coerce_iu_vv",
    CoerceIDVV => "coerce_id_vv",
    CoerceUIVV => "coerce_ui_vv",
    CoerceUDVV => "coerce_ud_vv",
    CoerceDIVV => "coerce_di_vv",
    CoerceDUVV => "coerce_du_vv",
    CoerceVecIUVV => "coerce_vec_iu_vv",
    CoerceVecIDVV => "coerce_vec_id_vv",
    CoerceVecUIVV => "coerce_vec_ui_vv",
    CoerceVecUDVV => "coerce_vec_ud_vv",
    CoerceVecDIVV => "coerce_vec_di_vv",
    CoerceVecDUVV => "coerce_vec_du_vv",

    // Aggregate reads.
    TableIndex1VVV => "table_index1_vvv",
    TableIndex1VVC => "table_index1_vvc",
    TableIndexVVA => "table_index_vva",
    IndexVecVVV => "index_vec_vvv",
    IndexVecVVi => "index_vec_vvi",
    IndexVecSliceVVA => "index_vec_slice_vva",
    IndexStringVVV => "index_string_vvv",
    IndexStringVVi => "index_string_vvi",
    IndexStringSliceVVA => "index_string_slice_vva",
    FieldVVi => "field_vvi",
    HasFieldVVi => "has_field_vvi",
    SizeVV => "size_vv",

    // Aggregate writes.
    TableElemAssignVVA => "table_elem_assign_vva",
    TableElemAssignVCA => "table_elem_assign_vca",
    VectorElemAssignVVV => "vector_elem_assign_vvv",
    VectorElemAssignVVi => "vector_elem_assign_vvi",
    VectorElemAssignVVC => "vector_elem_assign_vvc",
    VectorSliceAssignVVA => "vector_slice_assign_vva",
    FieldAssignVVi => "field_assign_vvi",
    FieldAssignVCi => "field_assign_vci",

    // Membership tests.
    ValIsInTableVVV => "val_is_in_table_vvv",
    ConstIsInTableVCV => "const_is_in_table_vcv",
    Val2IsInTableVVVV => "val2_is_in_table_vvvv",
    Val2IsInTableVVVC => "val2_is_in_table_vvvc",
    Val2IsInTableVVCV => "val2_is_in_table_vvcv",
    ListIsInTableVVA => "list_is_in_table_vva",
    IndexIsInVectorVVA => "index_is_in_vector_vva",
    StrInStrVVV => "str_in_str_vvv",
    StrInStrVVC => "str_in_str_vvc",
    StrInStrVCV => "str_in_str_vcv",
    PatInStrVVV => "pat_in_str_vvv",
    PatInStrVVC => "pat_in_str_vvc",
    PatInStrVCV => "pat_in_str_vcv",
    AddrInSubnetVVV => "addr_in_subnet_vvv",
    AddrInSubnetVVC => "addr_in_subnet_vvc",
    AddrInSubnetVCV => "addr_in_subnet_vcv",

    // Constructors and aggregate initialization.
    ConstructTableVA => "construct_table_va",
    ConstructSetVA => "construct_set_va",
    ConstructRecordVA => "construct_record_va",
    ConstructVectorVA => "construct_vector_va",
    InitRecordV => "init_record_v",
    InitVectorV => "init_vector_v",
    InitTableV => "init_table_v",

    // Iteration.
    InitTableLoopVVA => "init_table_loop_vva",
    InitVectorLoopVV => "init_vector_loop_vv",
    InitStringLoopVV => "init_string_loop_vv",
    NextTableIterVVA => "next_table_iter_vva",
    NextTableIterValVarVVVA => "next_table_iter_val_var_vvva",
    NextVectorIterVVV => "next_vector_iter_vvv",
    NextStringIterVVV => "next_string_iter_vvv",
    EndLoopV => "end_loop_v",

    // Calls.
    Call0X => "call0_x",
    AssignCall0V => "assign_call0_v",
    Call1V => "call1_v",
    Call1C => "call1_c",
    AssignCall1VV => "assign_call1_vv",
    AssignCall1VC => "assign_call1_vc",
    Call2A => "call2_a",
    AssignCall2VA => "assign_call2_va",
    Call3A => "call3_a",
    AssignCall3VA => "assign_call3_va",
    Call4A => "call4_a",
    AssignCall4VA => "assign_call4_va",
    Call5A => "call5_a",
    AssignCall5VA => "assign_call5_va",
    CallNA => "calln_a",
    AssignCallNVA => "assign_calln_va",
    IndCallNVA => "ind_calln_va",
    AssignIndCallNVVA => "assign_ind_calln_vva",

    // Built-in intrinsics.
    ToLowerVV => "to_lower_vv",
    SubBytesVVVV => "sub_bytes_vvvv",
    StrStrVVV => "strstr_vvv",
    StrStrVVC => "strstr_vvc",
    StrStrVCV => "strstr_vcv",
    LogWriteVVV => "log_write_vvv",
    LogWriteVV => "log_write_vv",
    LogFlushV => "log_flush_v",
    LogFlushX => "log_flush_x",
    PortProtoVV => "port_proto_vv",
    ReadingLiveTrafficV => "reading_live_traffic_v",
    ReadingTracesV => "reading_traces_v",

    // Events.
    EventA => "event_a",
}

impl Op {
    /// The canonical operand layout for instructions built with this opcode.
    /// Branch patching and immediates may refine it on the instruction.
    pub fn form(self) -> OperandForm {
        use OperandForm::*;
        match self {
            Op::Nop | Op::SyncGlobalsX | Op::ReturnX | Op::HookBreakX | Op::Call0X
            | Op::LogFlushX => X,
            Op::ReturnC | Op::Call1C => C,
            Op::GotoV | Op::DirtyGlobalV => V_I1,
            Op::ReturnV
            | Op::EndLoopV
            | Op::InitRecordV
            | Op::InitVectorV
            | Op::InitTableV
            | Op::AssignCall0V
            | Op::Call1V
            | Op::LogFlushV
            | Op::ReadingLiveTrafficV
            | Op::ReadingTracesV => V,
            Op::AssignVC | Op::AssignCall1VC => VC,
            Op::LoadValVV | Op::StoreValVV => VVFrame,
            Op::LoadGlobalVC => ViC,
            Op::IfVV | Op::IfNotVV | Op::IfElseVV => VV,
            Op::WhenVV => VV_I1_I2,
            Op::WhenTimeoutVVVC => VVVC_I1_I2_I3,
            Op::WhenTimeoutVVVV => VVVV_I2_I3_I4,
            Op::SwitchIntVVV | Op::SwitchCountVVV | Op::SwitchDoubleVVV | Op::SwitchStrVVV
            | Op::HasFieldCondVVV | Op::NotHasFieldCondVVV => VVV_I2_I3,
            Op::ValIsInTableCondVVV | Op::ValIsNotInTableCondVVV => VVV_I3,
            Op::ConstIsInTableCondVVC | Op::ConstIsNotInTableCondVVC => VVC_I2,
            Op::EventA => A,
            Op::Call2A | Op::Call3A | Op::Call4A | Op::Call5A | Op::CallNA => A,
            Op::AssignCall2VA | Op::AssignCall3VA | Op::AssignCall4VA | Op::AssignCall5VA
            | Op::AssignCallNVA | Op::IndCallNVA => VA,
            Op::AssignIndCallNVVA => VVA,
            Op::ConstructTableVA | Op::ConstructSetVA | Op::ConstructRecordVA
            | Op::ConstructVectorVA => VA,
            Op::TableIndexVVA
            | Op::IndexVecSliceVVA
            | Op::IndexStringSliceVVA
            | Op::TableElemAssignVVA
            | Op::VectorSliceAssignVVA
            | Op::ListIsInTableVVA
            | Op::IndexIsInVectorVVA
            | Op::InitTableLoopVVA => VVA,
            Op::TableElemAssignVCA => VCA,
            Op::NextTableIterVVA => VVA_I2,
            Op::NextTableIterValVarVVVA => VVVA_I3,
            Op::NextVectorIterVVV | Op::NextStringIterVVV => VVV_I3,
            Op::FieldVVi | Op::HasFieldVVi | Op::IndexVecVVi | Op::IndexStringVVi
            | Op::VectorElemAssignVVi | Op::FieldAssignVVi => VVV_I3,
            Op::FieldAssignVCi => VVC_I2,
            Op::SubBytesVVVV | Op::Val2IsInTableVVVV => VVVV,
            Op::Val2IsInTableVVVC | Op::Val2IsInTableVVCV => VVVC,
            Op::AssignVV
            | Op::AssignCall1VV
            | Op::ToLowerVV
            | Op::PortProtoVV
            | Op::SizeVV
            | Op::NegIntVV
            | Op::NegDoubleVV
            | Op::NotVV
            | Op::NegVecVV
            | Op::CoerceIUVV
            | Op::CoerceIDVV
            | Op::CoerceUIVV
            | Op::CoerceUDVV
            | Op::CoerceDIVV
            | Op::CoerceDUVV
            | Op::CoerceVecIUVV
            | Op::CoerceVecIDVV
            | Op::CoerceVecUIVV
            | Op::CoerceVecUDVV
            | Op::CoerceVecDIVV
            | Op::CoerceVecDUVV
            | Op::InitVectorLoopVV
            | Op::InitStringLoopVV
            | Op::LogWriteVV => VV,
            Op::LogWriteVVV
            | Op::StrStrVVV
            | Op::TableIndex1VVV
            | Op::IndexVecVVV
            | Op::IndexStringVVV
            | Op::VectorElemAssignVVV
            | Op::ValIsInTableVVV
            | Op::StrInStrVVV
            | Op::PatInStrVVV
            | Op::AddrInSubnetVVV
            | Op::EqAddrVVV
            | Op::NeAddrVVV
            | Op::AddVecVVV
            | Op::SubVecVVV
            | Op::MulVecVVV
            | Op::DivVecVVV => VVV,
            Op::TableIndex1VVC
            | Op::VectorElemAssignVVC
            | Op::ConstIsInTableVCV
            | Op::StrInStrVVC
            | Op::StrInStrVCV
            | Op::PatInStrVVC
            | Op::PatInStrVCV
            | Op::AddrInSubnetVVC
            | Op::AddrInSubnetVCV
            | Op::StrStrVVC
            | Op::StrStrVCV => VVC,
            // Generic and flavored binary families share shapes.
            op => {
                let name = op.name();
                if name.ends_with("vvv") {
                    VVV
                } else if name.ends_with("vvc") || name.ends_with("vcv") {
                    VVC
                } else {
                    VV
                }
            }
        }
    }

    /// Whether the instruction's `v1` is an assignment destination.
    pub fn assigns_to_slot1(self) -> bool {
        use Op::*;
        match self {
            AssignVV | AssignVC | LoadValVV | LoadGlobalVC => true,
            ToLowerVV | SubBytesVVVV | StrStrVVV | StrStrVVC | StrStrVCV | PortProtoVV
            | ReadingLiveTrafficV | ReadingTracesV | LogWriteVVV | LogFlushV => true,
            AssignCall0V | AssignCall1VV | AssignCall1VC | AssignCall2VA | AssignCall3VA
            | AssignCall4VA | AssignCall5VA | AssignCallNVA | AssignIndCallNVVA => true,
            TableIndex1VVV | TableIndex1VVC | TableIndexVVA | IndexVecVVV | IndexVecVVi
            | IndexVecSliceVVA | IndexStringVVV | IndexStringVVi | IndexStringSliceVVA
            | FieldVVi | HasFieldVVi | SizeVV => true,
            ValIsInTableVVV | ConstIsInTableVCV | Val2IsInTableVVVV | Val2IsInTableVVVC
            | Val2IsInTableVVCV | ListIsInTableVVA | IndexIsInVectorVVA | StrInStrVVV
            | StrInStrVVC | StrInStrVCV | PatInStrVVV | PatInStrVVC | PatInStrVCV
            | AddrInSubnetVVV | AddrInSubnetVVC | AddrInSubnetVCV | EqAddrVVV | NeAddrVVV => true,
            ConstructTableVA | ConstructSetVA | ConstructRecordVA | ConstructVectorVA
            | InitRecordV | InitVectorV | InitTableV => true,
            InitTableLoopVVA | InitVectorLoopVV | InitStringLoopVV => true,
            NextTableIterValVarVVVA | NextVectorIterVVV | NextStringIterVVV => true,
            NegIntVV | NegDoubleVV | NotVV | NegVecVV => true,
            CoerceIUVV | CoerceIDVV | CoerceUIVV | CoerceUDVV | CoerceDIVV | CoerceDUVV
            | CoerceVecIUVV | CoerceVecIDVV | CoerceVecUIVV | CoerceVecUDVV | CoerceVecDIVV
            | CoerceVecDUVV => true,
            AddVecVVV | SubVecVVV | MulVecVVV | DivVecVVV => true,
            _ => {
                // All remaining assigning ops are the binary arithmetic and
                // comparison families, generic or flavored.
                let name = self.name();
                name.starts_with("add_")
                    || name.starts_with("sub_")
                    || name.starts_with("mul_")
                    || name.starts_with("div_")
                    || name.starts_with("mod_")
                    || name.starts_with("eq_")
                    || name.starts_with("ne_")
                    || name.starts_with("lt_")
                    || name.starts_with("le_")
                    || name.starts_with("gt_")
                    || name.starts_with("ge_")
            }
        }
    }

    /// Whether execution never falls through to the next instruction.
    pub fn does_not_continue(self) -> bool {
        matches!(
            self,
            Op::GotoV | Op::ReturnV | Op::ReturnC | Op::ReturnX | Op::HookBreakX
        )
    }

    pub fn is_unconditional_branch(self) -> bool {
        self == Op::GotoV
    }

    /// A plain slot-to-slot move; removable when source and destination
    /// coincide after remapping.
    pub fn is_direct_assignment(self) -> bool {
        self == Op::AssignVV
    }

    pub fn is_global_load(self) -> bool {
        self == Op::LoadGlobalVC
    }

    pub fn is_frame_load(self) -> bool {
        self == Op::LoadValVV
    }

    pub fn is_frame_store(self) -> bool {
        self == Op::StoreValVV
    }

    /// Whether the instruction must survive even if its assignment
    /// destination is unused. Side-effecting assigners are re-flavored
    /// through the assignmentless table instead of being killed.
    pub fn side_effects(self) -> bool {
        use Op::*;
        matches!(
            self,
            Call0X | AssignCall0V | Call1V | Call1C | AssignCall1VV | AssignCall1VC | Call2A
                | AssignCall2VA | Call3A | AssignCall3VA | Call4A | AssignCall4VA | Call5A
                | AssignCall5VA | CallNA | AssignCallNVA | IndCallNVA | AssignIndCallNVVA
                | LogWriteVVV | LogWriteVV | LogFlushV | LogFlushX | EventA | SyncGlobalsX
                | DirtyGlobalV | StoreValVV | TableElemAssignVVA | TableElemAssignVCA
                | VectorElemAssignVVV | VectorElemAssignVVi | VectorElemAssignVVC
                | VectorSliceAssignVVA | FieldAssignVVi | FieldAssignVCi | WhenVV
                | WhenTimeoutVVVC | WhenTimeoutVVVV | NextTableIterVVA | EndLoopV
                | HookBreakX
        )
    }

    /// The fused conditional with the opposite sense, where one exists.
    /// Inverting such a branch is a single opcode swap.
    pub fn negated_cond(self) -> Option<Op> {
        use Op::*;
        match self {
            HasFieldCondVVV => Some(NotHasFieldCondVVV),
            NotHasFieldCondVVV => Some(HasFieldCondVVV),
            ValIsInTableCondVVV => Some(ValIsNotInTableCondVVV),
            ValIsNotInTableCondVVV => Some(ValIsInTableCondVVV),
            ConstIsInTableCondVVC => Some(ConstIsNotInTableCondVVC),
            ConstIsNotInTableCondVVC => Some(ConstIsInTableCondVVC),
            _ => None,
        }
    }
}

struct OpTables {
    flavors: FxHashMap<(Op, TypeTag), Op>,
    assignmentless: FxHashMap<Op, (Op, OperandForm)>,
}

/// (generic op, normalized tag, concrete op) triples the flavor map is built
/// from.
static FLAVOR_DESC: &[(Op, TypeTag, Op)] = &[
    (Op::AddVVV, TypeTag::Int, Op::AddIntVVV),
    (Op::AddVVC, TypeTag::Int, Op::AddIntVVC),
    (Op::SubVVV, TypeTag::Int, Op::SubIntVVV),
    (Op::SubVVC, TypeTag::Int, Op::SubIntVVC),
    (Op::SubVCV, TypeTag::Int, Op::SubIntVCV),
    (Op::MulVVV, TypeTag::Int, Op::MulIntVVV),
    (Op::MulVVC, TypeTag::Int, Op::MulIntVVC),
    (Op::DivVVV, TypeTag::Int, Op::DivIntVVV),
    (Op::DivVVC, TypeTag::Int, Op::DivIntVVC),
    (Op::DivVCV, TypeTag::Int, Op::DivIntVCV),
    (Op::ModVVV, TypeTag::Int, Op::ModIntVVV),
    (Op::ModVVC, TypeTag::Int, Op::ModIntVVC),
    (Op::ModVCV, TypeTag::Int, Op::ModIntVCV),
    (Op::AddVVV, TypeTag::Count, Op::AddCountVVV),
    (Op::AddVVC, TypeTag::Count, Op::AddCountVVC),
    (Op::SubVVV, TypeTag::Count, Op::SubCountVVV),
    (Op::SubVVC, TypeTag::Count, Op::SubCountVVC),
    (Op::SubVCV, TypeTag::Count, Op::SubCountVCV),
    (Op::MulVVV, TypeTag::Count, Op::MulCountVVV),
    (Op::MulVVC, TypeTag::Count, Op::MulCountVVC),
    (Op::DivVVV, TypeTag::Count, Op::DivCountVVV),
    (Op::DivVVC, TypeTag::Count, Op::DivCountVVC),
    (Op::DivVCV, TypeTag::Count, Op::DivCountVCV),
    (Op::ModVVV, TypeTag::Count, Op::ModCountVVV),
    (Op::ModVVC, TypeTag::Count, Op::ModCountVVC),
    (Op::ModVCV, TypeTag::Count, Op::ModCountVCV),
    (Op::AddVVV, TypeTag::Double, Op::AddDoubleVVV),
    (Op::AddVVC, TypeTag::Double, Op::AddDoubleVVC),
    (Op::SubVVV, TypeTag::Double, Op::SubDoubleVVV),
    (Op::SubVVC, TypeTag::Double, Op::SubDoubleVVC),
    (Op::SubVCV, TypeTag::Double, Op::SubDoubleVCV),
    (Op::MulVVV, TypeTag::Double, Op::MulDoubleVVV),
    (Op::MulVVC, TypeTag::Double, Op::MulDoubleVVC),
    (Op::DivVVV, TypeTag::Double, Op::DivDoubleVVV),
    (Op::DivVVC, TypeTag::Double, Op::DivDoubleVVC),
    (Op::DivVCV, TypeTag::Double, Op::DivDoubleVCV),
    (Op::AddVVV, TypeTag::Str, Op::AddStrVVV),
    (Op::AddVVC, TypeTag::Str, Op::AddStrVVC),
    (Op::AddVCV, TypeTag::Int, Op::AddIntVVC),
    (Op::AddVCV, TypeTag::Count, Op::AddCountVVC),
    (Op::AddVCV, TypeTag::Double, Op::AddDoubleVVC),
    (Op::AddVCV, TypeTag::Str, Op::AddStrVCV),
    (Op::EqVVV, TypeTag::Int, Op::EqIntVVV),
    (Op::EqVVC, TypeTag::Int, Op::EqIntVVC),
    (Op::NeVVV, TypeTag::Int, Op::NeIntVVV),
    (Op::NeVVC, TypeTag::Int, Op::NeIntVVC),
    (Op::LtVVV, TypeTag::Int, Op::LtIntVVV),
    (Op::LtVVC, TypeTag::Int, Op::LtIntVVC),
    (Op::LeVVV, TypeTag::Int, Op::LeIntVVV),
    (Op::LeVVC, TypeTag::Int, Op::LeIntVVC),
    (Op::GtVVV, TypeTag::Int, Op::GtIntVVV),
    (Op::GtVVC, TypeTag::Int, Op::GtIntVVC),
    (Op::GeVVV, TypeTag::Int, Op::GeIntVVV),
    (Op::GeVVC, TypeTag::Int, Op::GeIntVVC),
    (Op::EqVVV, TypeTag::Count, Op::EqCountVVV),
    (Op::EqVVC, TypeTag::Count, Op::EqCountVVC),
    (Op::NeVVV, TypeTag::Count, Op::NeCountVVV),
    (Op::NeVVC, TypeTag::Count, Op::NeCountVVC),
    (Op::LtVVV, TypeTag::Count, Op::LtCountVVV),
    (Op::LtVVC, TypeTag::Count, Op::LtCountVVC),
    (Op::LeVVV, TypeTag::Count, Op::LeCountVVV),
    (Op::LeVVC, TypeTag::Count, Op::LeCountVVC),
    (Op::GtVVV, TypeTag::Count, Op::GtCountVVV),
    (Op::GtVVC, TypeTag::Count, Op::GtCountVVC),
    (Op::GeVVV, TypeTag::Count, Op::GeCountVVV),
    (Op::GeVVC, TypeTag::Count, Op::GeCountVVC),
    (Op::EqVVV, TypeTag::Double, Op::EqDoubleVVV),
    (Op::EqVVC, TypeTag::Double, Op::EqDoubleVVC),
    (Op::NeVVV, TypeTag::Double, Op::NeDoubleVVV),
    (Op::NeVVC, TypeTag::Double, Op::NeDoubleVVC),
    (Op::LtVVV, TypeTag::Double, Op::LtDoubleVVV),
    (Op::LtVVC, TypeTag::Double, Op::LtDoubleVVC),
    (Op::LeVVV, TypeTag::Double, Op::LeDoubleVVV),
    (Op::LeVVC, TypeTag::Double, Op::LeDoubleVVC),
    (Op::GtVVV, TypeTag::Double, Op::GtDoubleVVV),
    (Op::GtVVC, TypeTag::Double, Op::GtDoubleVVC),
    (Op::GeVVV, TypeTag::Double, Op::GeDoubleVVV),
    (Op::GeVVC, TypeTag::Double, Op::GeDoubleVVC),
    (Op::EqVVV, TypeTag::Str, Op::EqStrVVV),
    (Op::EqVVC, TypeTag::Str, Op::EqStrVVC),
    (Op::NeVVV, TypeTag::Str, Op::NeStrVVV),
    (Op::NeVVC, TypeTag::Str, Op::NeStrVVC),
    (Op::LtVVV, TypeTag::Str, Op::LtStrVVV),
    (Op::LtVVC, TypeTag::Str, Op::LtStrVVC),
    (Op::LeVVV, TypeTag::Str, Op::LeStrVVV),
    (Op::LeVVC, TypeTag::Str, Op::LeStrVVC),
    (Op::GtVVV, TypeTag::Str, Op::GtStrVVV),
    (Op::GtVVC, TypeTag::Str, Op::GtStrVVC),
    (Op::GeVVV, TypeTag::Str, Op::GeStrVVV),
    (Op::GeVVC, TypeTag::Str, Op::GeStrVVC),
    (Op::EqVVV, TypeTag::Addr, Op::EqAddrVVV),
    (Op::NeVVV, TypeTag::Addr, Op::NeAddrVVV),
];

/// (assigning op, assignmentless op, resulting form) triples. Operand slots
/// shift down by one when the destination is dropped.
static ASSIGNMENTLESS_DESC: &[(Op, Op, OperandForm)] = &[
    (Op::LogWriteVVV, Op::LogWriteVV, OperandForm::VV),
    (Op::LogFlushV, Op::LogFlushX, OperandForm::X),
    (Op::AssignCall0V, Op::Call0X, OperandForm::X),
    (Op::AssignCall1VV, Op::Call1V, OperandForm::V),
    (Op::AssignCall1VC, Op::Call1C, OperandForm::C),
    (Op::AssignCall2VA, Op::Call2A, OperandForm::A),
    (Op::AssignCall3VA, Op::Call3A, OperandForm::A),
    (Op::AssignCall4VA, Op::Call4A, OperandForm::A),
    (Op::AssignCall5VA, Op::Call5A, OperandForm::A),
    (Op::AssignCallNVA, Op::CallNA, OperandForm::A),
    (Op::AssignIndCallNVVA, Op::IndCallNVA, OperandForm::VA),
];

fn tables() -> &'static OpTables {
    static TABLES: OnceLock<OpTables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut flavors = FxHashMap::default();
        for (generic, tag, concrete) in FLAVOR_DESC {
            flavors.insert((*generic, *tag), *concrete);
        }
        let mut assignmentless = FxHashMap::default();
        for (orig, bare, form) in ASSIGNMENTLESS_DESC {
            assignmentless.insert(*orig, (*bare, *form));
        }
        OpTables {
            flavors,
            assignmentless,
        }
    })
}

/// Resolves a generic assigning opcode to its type-specialized concrete
/// form. The tag is normalized first. `None` marks a compiler inconsistency
/// the caller reports as an internal error.
pub fn assignment_flavor(op: Op, tag: TypeTag) -> Option<Op> {
    tables().flavors.get(&(op, normalized_tag(tag))).copied()
}

/// The assignmentless counterpart of a side-effecting assigning opcode.
pub fn assignmentless(op: Op) -> Option<(Op, OperandForm)> {
    tables().assignmentless.get(&op).copied()
}
