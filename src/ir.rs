//! Minimal SSA intermediate representation consumed by the liveness and
//! coalescing passes.
//!
//! This is deliberately a small carrier: basic blocks with φ-nodes and
//! ordinary statements, SSA value versions tied to the program variable they
//! descend from, and the predecessor/successor edges the analyses walk. The
//! passes only ever iterate it; construction happens through the builder
//! methods on [`Function`].
//!
//! The entry pseudo-block is implicit. The function's entry block simply has
//! no stored predecessor edge coming from outside the function, so backward
//! propagation stops there naturally.

use crate::entity::packed_option::PackedOption;
use crate::entity::{entity_impl, PrimaryMap, SecondaryMap};
use core::fmt;
use smallvec::SmallVec;

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
entity_impl!(Block, "block");

/// An opaque reference to a statement (including φ-nodes).
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
entity_impl!(Inst, "inst");

/// An SSA value version: one definition of a program variable.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(u32);
entity_impl!(Value, "v");

/// A source-level or compiler-generated variable declaration.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Var(u32);
entity_impl!(Var, "var");

/// The type of a program variable.
///
/// Only identity matters to the passes here: partitions may be grouped by
/// type, and grouping compares types for equality. The handful of constants
/// below covers what the tests and any embedding front end need.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Type(u8);

impl Type {
    /// An invalid type, the default.
    pub const INVALID: Type = Type(0);
    /// An 8-bit integer.
    pub const I8: Type = Type(1);
    /// A 16-bit integer.
    pub const I16: Type = Type(2);
    /// A 32-bit integer.
    pub const I32: Type = Type(3);
    /// A 64-bit integer.
    pub const I64: Type = Type(4);
    /// A 32-bit float.
    pub const F32: Type = Type(5);
    /// A 64-bit float.
    pub const F64: Type = Type(6);
}

impl Default for Type {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Type::I8 => "i8",
            Type::I16 => "i16",
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "f32",
            Type::F64 => "f64",
            _ => "invalid",
        })
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Either an SSA value version or a program variable.
///
/// Partition maps accept both: before storage binding a partition is
/// represented by one of its SSA versions, afterwards by the program
/// variable it was assigned to.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum Name {
    /// An SSA value version.
    Value(Value),
    /// A program variable.
    Var(Var),
}

impl From<Value> for Name {
    fn from(v: Value) -> Self {
        Self::Value(v)
    }
}

impl From<Var> for Name {
    fn from(v: Var) -> Self {
        Self::Var(v)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Value(v) => fmt::Display::fmt(&v, f),
            Self::Var(v) => fmt::Display::fmt(&v, f),
        }
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A program variable declaration.
#[derive(Clone)]
pub struct VarData {
    /// Source name, for diagnostics only.
    pub name: String,

    /// The declared type.
    pub ty: Type,

    /// Volatile storage; never eligible for type-based coalescing.
    pub volatile: bool,

    /// A formal parameter of the function.
    pub parameter: bool,

    /// The function result variable.
    pub result: bool,

    /// Declared with a register storage class.
    pub register: bool,

    /// Compiler-generated and invisible to the user. Only artificial
    /// variables may be coalesced across types.
    pub artificial: bool,

    /// Already assigned a fixed storage location.
    pub hard_storage: bool,

    /// Whether versions of this variable are ordinary register candidates.
    /// Versions of a non-candidate variable are virtual operands and must
    /// never enter a partition map.
    pub reg_candidate: bool,

    /// Referenced by at least one scanned statement.
    pub used: bool,

    /// The version of this variable that is live on entry to the function
    /// without any defining statement, if one exists.
    pub default_def: PackedOption<Value>,
}

impl VarData {
    fn new(name: String, ty: Type) -> Self {
        Self {
            name,
            ty,
            volatile: false,
            parameter: false,
            result: false,
            register: false,
            artificial: false,
            hard_storage: false,
            reg_candidate: true,
            used: false,
            default_def: None.into(),
        }
    }
}

/// An SSA value version: its root variable and defining statement.
#[derive(Clone)]
struct ValueData {
    var: Var,
    def: PackedOption<Inst>,
}

/// The payload of a statement.
#[derive(Clone)]
enum InstKind {
    /// A simple assignment `dst := src` between two registered operands.
    Copy,
    /// Any other statement, described only by its operands.
    Op,
    /// A φ-node with one incoming value per predecessor edge.
    Phi(SmallVec<[(Value, Block); 2]>),
}

#[derive(Clone)]
struct InstData {
    kind: InstKind,
    defs: SmallVec<[Value; 2]>,
    uses: SmallVec<[Value; 4]>,
    /// Virtual operands; used only by debug cross-checks.
    virt: SmallVec<[Value; 2]>,
}

/// Per-block data: φ-nodes, ordinary statements, and CFG edges.
#[derive(Clone, Default)]
struct BlockData {
    phis: Vec<Inst>,
    insts: Vec<Inst>,
    preds: Vec<Block>,
    succs: Vec<Block>,
}

/// A function in SSA form.
pub struct Function {
    vars: PrimaryMap<Var, VarData>,
    values: PrimaryMap<Value, ValueData>,
    insts: PrimaryMap<Inst, InstData>,
    inst_block: SecondaryMap<Inst, PackedOption<Block>>,
    blocks: PrimaryMap<Block, BlockData>,
    /// Block layout order; the first block is the entry.
    layout: Vec<Block>,
}

impl Function {
    /// Create an empty function.
    pub fn new() -> Self {
        Self {
            vars: PrimaryMap::new(),
            values: PrimaryMap::new(),
            insts: PrimaryMap::new(),
            inst_block: SecondaryMap::new(),
            blocks: PrimaryMap::new(),
            layout: Vec::new(),
        }
    }

    /// Declare a new program variable.
    pub fn make_var(&mut self, name: &str, ty: Type) -> Var {
        self.vars.push(VarData::new(name.to_string(), ty))
    }

    /// Get a mutable reference to `var`'s declaration, for setting flags.
    pub fn var_mut(&mut self, var: Var) -> &mut VarData {
        &mut self.vars[var]
    }

    /// Get `var`'s declaration.
    pub fn var(&self, var: Var) -> &VarData {
        &self.vars[var]
    }

    /// Create a new SSA version of `var`. The defining statement is recorded
    /// when the version appears as a def.
    pub fn make_value(&mut self, var: Var) -> Value {
        self.values.push(ValueData {
            var,
            def: None.into(),
        })
    }

    /// Create the default def of `var`: a version with no defining
    /// statement, live on entry to the function.
    ///
    /// A variable has at most one default def; creating a second replaces
    /// the record of the first.
    pub fn make_default_def(&mut self, var: Var) -> Value {
        let value = self.make_value(var);
        self.vars[var].default_def = value.into();
        value
    }

    /// Append a new basic block. The first block created is the entry.
    pub fn make_block(&mut self) -> Block {
        let block = self.blocks.push(BlockData::default());
        self.layout.push(block);
        block
    }

    /// Add a CFG edge from `pred` to `succ`.
    pub fn add_edge(&mut self, pred: Block, succ: Block) {
        self.blocks[pred].succs.push(succ);
        self.blocks[succ].preds.push(pred);
    }

    fn record_defs(&mut self, inst: Inst, block: Block) {
        self.inst_block[inst] = block.into();
        let defs = self.insts[inst].defs.clone();
        for def in defs {
            self.values[def].def = inst.into();
        }
    }

    /// Append a φ-node to `block`. `args` pairs each incoming value with the
    /// predecessor block of its edge, in edge order.
    pub fn append_phi(&mut self, block: Block, result: Value, args: &[(Value, Block)]) -> Inst {
        let inst = self.insts.push(InstData {
            kind: InstKind::Phi(args.iter().copied().collect()),
            defs: core::iter::once(result).collect(),
            uses: SmallVec::new(),
            virt: SmallVec::new(),
        });
        self.blocks[block].phis.push(inst);
        self.record_defs(inst, block);
        inst
    }

    /// Append a copy statement `dst := src` to `block`.
    pub fn append_copy(&mut self, block: Block, dst: Value, src: Value) -> Inst {
        let inst = self.insts.push(InstData {
            kind: InstKind::Copy,
            defs: core::iter::once(dst).collect(),
            uses: core::iter::once(src).collect(),
            virt: SmallVec::new(),
        });
        self.blocks[block].insts.push(inst);
        self.record_defs(inst, block);
        inst
    }

    /// Append an ordinary statement with the given def and use operands.
    pub fn append_op(&mut self, block: Block, defs: &[Value], uses: &[Value]) -> Inst {
        let inst = self.insts.push(InstData {
            kind: InstKind::Op,
            defs: defs.iter().copied().collect(),
            uses: uses.iter().copied().collect(),
            virt: SmallVec::new(),
        });
        self.blocks[block].insts.push(inst);
        self.record_defs(inst, block);
        inst
    }

    /// Attach a virtual operand to `inst`. Virtual operands never enter the
    /// partition map; they exist so debug builds can check that no variable
    /// is used both virtually and as a register candidate.
    pub fn append_virt_operand(&mut self, inst: Inst, value: Value) {
        self.insts[inst].virt.push(value);
    }

    /// The entry block, if any block exists.
    pub fn entry_block(&self) -> Option<Block> {
        self.layout.first().copied()
    }

    /// Iterate over all blocks in layout order.
    pub fn blocks(&self) -> impl Iterator<Item = Block> + '_ {
        self.layout.iter().copied()
    }

    /// The predecessor blocks of `block`, one entry per CFG edge.
    pub fn preds(&self, block: Block) -> &[Block] {
        &self.blocks[block].preds
    }

    /// The successor blocks of `block`, one entry per CFG edge.
    pub fn succs(&self, block: Block) -> &[Block] {
        &self.blocks[block].succs
    }

    /// The φ-nodes of `block`, in order.
    pub fn phis(&self, block: Block) -> &[Inst] {
        &self.blocks[block].phis
    }

    /// The ordinary statements of `block`, in order.
    pub fn block_insts(&self, block: Block) -> &[Inst] {
        &self.blocks[block].insts
    }

    /// If `inst` is a simple copy, return `(dst, src)`.
    pub fn is_copy(&self, inst: Inst) -> Option<(Value, Value)> {
        let data = &self.insts[inst];
        match data.kind {
            InstKind::Copy => Some((data.defs[0], data.uses[0])),
            _ => None,
        }
    }

    /// The def operands of `inst`.
    pub fn defs(&self, inst: Inst) -> &[Value] {
        &self.insts[inst].defs
    }

    /// The use operands of `inst`. φ arguments are not uses; they are
    /// reached through [`Function::phi_args`].
    pub fn uses(&self, inst: Inst) -> &[Value] {
        &self.insts[inst].uses
    }

    /// The virtual operands of `inst`.
    pub fn virt_operands(&self, inst: Inst) -> &[Value] {
        &self.insts[inst].virt
    }

    /// The result of φ-node `inst`.
    pub fn phi_result(&self, inst: Inst) -> Value {
        debug_assert!(matches!(self.insts[inst].kind, InstKind::Phi(_)));
        self.insts[inst].defs[0]
    }

    /// The arguments of φ-node `inst` with their incoming edges, represented
    /// by the source block of each edge.
    pub fn phi_args(&self, inst: Inst) -> &[(Value, Block)] {
        match self.insts[inst].kind {
            InstKind::Phi(ref args) => args,
            _ => &[],
        }
    }

    /// The statement defining `value`, or `None` for a default def.
    pub fn value_def(&self, value: Value) -> Option<Inst> {
        self.values[value].def.expand()
    }

    /// The block containing `inst`, or `None` if it was never appended to
    /// one.
    pub fn block_of(&self, inst: Inst) -> Option<Block> {
        self.inst_block[inst].expand()
    }

    /// The block containing the statement defining `value`, or `None` for a
    /// default def.
    pub fn def_block(&self, value: Value) -> Option<Block> {
        let inst = self.values[value].def.expand()?;
        self.block_of(inst)
    }

    /// The root program variable of `value`.
    pub fn root_var(&self, value: Value) -> Var {
        self.values[value].var
    }

    /// The default def of `var`, if one was created.
    pub fn default_def(&self, var: Var) -> Option<Value> {
        self.vars[var].default_def.expand()
    }

    /// Number of SSA value versions created.
    pub fn num_values(&self) -> usize {
        self.values.len()
    }

    /// Number of basic blocks created.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Iterate over all program variables.
    pub fn vars(&self) -> impl Iterator<Item = Var> + '_ {
        self.vars.keys()
    }

    /// Iterate over all SSA value versions.
    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.values.keys()
    }
}

impl Default for Function {
    fn default() -> Self {
        Self::new()
    }
}
