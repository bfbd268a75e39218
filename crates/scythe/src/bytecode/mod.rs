//! Module Image Format
//!
//! In-memory tree of a module image plus its binary codec. Rewriting stages
//! operate on the tree; the codec turns it back into bytes.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ "SCYM" │ version │ name │ super │ interfaces │ fields │ methods │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Branch targets are [`Label`] pseudo-instructions rather than byte
//! offsets, so inserting instructions never requires offset fix-ups.

mod codec;
pub mod subroutine;

pub use codec::{decode, encode, FormatError, MAGIC, VERSION};

use std::collections::BTreeSet;
use std::fmt;

/// Member flag: static
pub const ACC_STATIC: u8 = 0x01;
/// Member flag: generated by the instrumenter
pub const ACC_SYNTHETIC: u8 = 0x02;

/// File extension of module images on disk
pub const MODULE_EXTENSION: &str = "smod";

/// Branch target identifier, unique within one method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u16);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A single instruction of the module instruction set
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Do nothing
    Nop,
    /// Push an integer constant
    Push(i32),
    /// Push a string constant
    Ldc(String),
    /// Push a local
    Load(u16),
    /// Pop into a local
    Store(u16),
    /// Integer addition
    Add,
    /// Integer subtraction
    Sub,
    /// Integer multiplication
    Mul,
    /// Integer division
    Div,
    /// Source line marker
    Line(u32),
    /// Branch target
    Label(Label),
    /// Unconditional jump
    Goto(Label),
    /// Jump if the popped value is zero
    IfZero(Label),
    /// Jump if the popped value is not zero
    IfNonZero(Label),
    /// Jump if the popped value is negative
    IfLt(Label),
    /// Jump if the popped value is not negative
    IfGe(Label),
    /// Call a subroutine, pushing the return address
    Jsr(Label),
    /// Return from a subroutine through the address held in a local
    Ret(u16),
    /// Static call `owner.method`
    Invoke {
        /// Owning module
        owner: String,
        /// Method name
        method: String,
    },
    /// Instantiate a module
    New(String),
    /// Push a static field
    GetStatic {
        /// Owning module
        owner: String,
        /// Field name
        field: String,
    },
    /// Pop into a static field
    PutStatic {
        /// Owning module
        owner: String,
        /// Field name
        field: String,
    },
    /// Pop an index and an array reference, increment that slot
    ArrayInc,
    /// Return from the method
    Return,
    /// Return the popped value from the method
    ReturnValue,
}

impl Instruction {
    /// Target label of a jump, conditional or subroutine call
    #[must_use]
    pub const fn jump_target(&self) -> Option<Label> {
        match self {
            Self::Goto(l)
            | Self::IfZero(l)
            | Self::IfNonZero(l)
            | Self::IfLt(l)
            | Self::IfGe(l)
            | Self::Jsr(l) => Some(*l),
            _ => None,
        }
    }

    /// Same instruction with its target replaced
    #[must_use]
    pub fn retarget(&self, target: Label) -> Self {
        match self {
            Self::Goto(_) => Self::Goto(target),
            Self::IfZero(_) => Self::IfZero(target),
            Self::IfNonZero(_) => Self::IfNonZero(target),
            Self::IfLt(_) => Self::IfLt(target),
            Self::IfGe(_) => Self::IfGe(target),
            Self::Jsr(_) => Self::Jsr(target),
            other => other.clone(),
        }
    }

    /// Whether this is a two-way conditional jump
    #[must_use]
    pub const fn is_conditional(&self) -> bool {
        matches!(
            self,
            Self::IfZero(_) | Self::IfNonZero(_) | Self::IfLt(_) | Self::IfGe(_)
        )
    }

    /// Module referenced by this instruction, if any
    #[must_use]
    pub fn referenced_module(&self) -> Option<&str> {
        match self {
            Self::Invoke { owner, .. }
            | Self::GetStatic { owner, .. }
            | Self::PutStatic { owner, .. } => Some(owner),
            Self::New(module) => Some(module),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nop => f.write_str("nop"),
            Self::Push(v) => write!(f, "push {v}"),
            Self::Ldc(s) => write!(f, "ldc {s:?}"),
            Self::Load(l) => write!(f, "load {l}"),
            Self::Store(l) => write!(f, "store {l}"),
            Self::Add => f.write_str("add"),
            Self::Sub => f.write_str("sub"),
            Self::Mul => f.write_str("mul"),
            Self::Div => f.write_str("div"),
            Self::Line(n) => write!(f, "line {n}"),
            Self::Label(l) => write!(f, "{l}:"),
            Self::Goto(l) => write!(f, "goto {l}"),
            Self::IfZero(l) => write!(f, "ifzero {l}"),
            Self::IfNonZero(l) => write!(f, "ifnonzero {l}"),
            Self::IfLt(l) => write!(f, "iflt {l}"),
            Self::IfGe(l) => write!(f, "ifge {l}"),
            Self::Jsr(l) => write!(f, "jsr {l}"),
            Self::Ret(l) => write!(f, "ret {l}"),
            Self::Invoke { owner, method } => write!(f, "invoke {owner}.{method}"),
            Self::New(m) => write!(f, "new {m}"),
            Self::GetStatic { owner, field } => write!(f, "getstatic {owner}.{field}"),
            Self::PutStatic { owner, field } => write!(f, "putstatic {owner}.{field}"),
            Self::ArrayInc => f.write_str("arrayinc"),
            Self::Return => f.write_str("return"),
            Self::ReturnValue => f.write_str("returnvalue"),
        }
    }
}

/// Field type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Single integer
    Int,
    /// Fixed-size integer array
    IntArray(u32),
}

/// Field declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Field name
    pub name: String,
    /// Field type
    pub kind: FieldKind,
    /// Member flags
    pub flags: u8,
}

impl Field {
    /// Create a field
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind, flags: u8) -> Self {
        Self {
            name: name.into(),
            kind,
            flags,
        }
    }
}

/// Method body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    /// Method name
    pub name: String,
    /// Member flags
    pub flags: u8,
    /// Number of local slots
    pub max_locals: u16,
    /// Instruction stream
    pub code: Vec<Instruction>,
}

impl Method {
    /// Create a static method with the given code
    #[must_use]
    pub fn new(name: impl Into<String>, code: Vec<Instruction>) -> Self {
        Self {
            name: name.into(),
            flags: ACC_STATIC,
            max_locals: 0,
            code,
        }
    }

    /// Set the number of local slots
    #[must_use]
    pub fn with_max_locals(mut self, max_locals: u16) -> Self {
        self.max_locals = max_locals;
        self
    }

    /// Labels defined or referenced by this method
    #[must_use]
    pub fn labels(&self) -> BTreeSet<Label> {
        self.code
            .iter()
            .filter_map(|insn| match insn {
                Instruction::Label(l) => Some(*l),
                other => other.jump_target(),
            })
            .collect()
    }

    /// Allocator for labels not yet used in this method
    #[must_use]
    pub fn label_allocator(&self) -> LabelAllocator {
        LabelAllocator {
            next: self.labels().last().map_or(0, |l| u32::from(l.0) + 1),
        }
    }

    /// Whether the method contains subroutine calls or returns
    #[must_use]
    pub fn has_subroutines(&self) -> bool {
        self.code
            .iter()
            .any(|insn| matches!(insn, Instruction::Jsr(_) | Instruction::Ret(_)))
    }
}

/// Hands out fresh labels for one method
#[derive(Debug, Clone)]
pub struct LabelAllocator {
    next: u32,
}

impl LabelAllocator {
    /// Next unused label
    pub fn fresh(&mut self) -> Result<Label, FormatError> {
        let label = u16::try_from(self.next).map_err(|_| FormatError::TooMany {
            what: "labels",
            count: self.next as usize,
        })?;
        self.next += 1;
        Ok(Label(label))
    }
}

/// Decoded module image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleImage {
    /// Module name, path form
    pub name: String,
    /// Supertype name, if any
    pub super_name: Option<String>,
    /// Implemented interfaces
    pub interfaces: Vec<String>,
    /// Declared fields
    pub fields: Vec<Field>,
    /// Declared methods
    pub methods: Vec<Method>,
}

impl ModuleImage {
    /// Create an empty module
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_name: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Set the supertype
    #[must_use]
    pub fn with_super(mut self, super_name: impl Into<String>) -> Self {
        self.super_name = Some(super_name.into());
        self
    }

    /// Add an interface
    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }

    /// Add a field
    #[must_use]
    pub fn with_field(mut self, field: Field) -> Self {
        self.fields.push(field);
        self
    }

    /// Add a method
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    /// Look up a field by name
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a method by name
    #[must_use]
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Encode to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, FormatError> {
        encode(self)
    }

    /// Decode from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FormatError> {
        decode(bytes)
    }
}

impl fmt::Display for ModuleImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "module {}", self.name)?;
        if let Some(ref super_name) = self.super_name {
            write!(f, " : {super_name}")?;
        }
        if !self.interfaces.is_empty() {
            write!(f, " implements {}", self.interfaces.join(", "))?;
        }
        writeln!(f)?;
        for field in &self.fields {
            match field.kind {
                FieldKind::Int => writeln!(f, "  field {} int", field.name)?,
                FieldKind::IntArray(len) => writeln!(f, "  field {} int[{len}]", field.name)?,
            }
        }
        for method in &self.methods {
            writeln!(f, "  method {} (locals {})", method.name, method.max_locals)?;
            for insn in &method.code {
                match insn {
                    Instruction::Label(_) => writeln!(f, "   {insn}")?,
                    _ => writeln!(f, "      {insn}")?,
                }
            }
        }
        Ok(())
    }
}
