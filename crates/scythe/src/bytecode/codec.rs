//! Binary codec for module images.
//!
//! All integers are big-endian; strings are a `u16` length followed by UTF-8.

use super::{Field, FieldKind, Instruction, Label, Method, ModuleImage};
use thiserror::Error;

/// Leading magic bytes of every module image
pub const MAGIC: [u8; 4] = *b"SCYM";

/// Current format version
pub const VERSION: u16 = 1;

mod op {
    pub const NOP: u8 = 0x00;
    pub const PUSH: u8 = 0x01;
    pub const LDC: u8 = 0x02;
    pub const LOAD: u8 = 0x03;
    pub const STORE: u8 = 0x04;
    pub const ADD: u8 = 0x05;
    pub const SUB: u8 = 0x06;
    pub const MUL: u8 = 0x07;
    pub const DIV: u8 = 0x08;
    pub const LINE: u8 = 0x09;
    pub const LABEL: u8 = 0x0A;
    pub const GOTO: u8 = 0x0B;
    pub const IFZERO: u8 = 0x0C;
    pub const IFNONZERO: u8 = 0x0D;
    pub const IFLT: u8 = 0x0E;
    pub const IFGE: u8 = 0x0F;
    pub const JSR: u8 = 0x10;
    pub const RET: u8 = 0x11;
    pub const INVOKE: u8 = 0x12;
    pub const NEW: u8 = 0x13;
    pub const GETSTATIC: u8 = 0x14;
    pub const PUTSTATIC: u8 = 0x15;
    pub const ARRAYINC: u8 = 0x16;
    pub const RETURN: u8 = 0x17;
    pub const RETURNVALUE: u8 = 0x18;
}

const KIND_INT: u8 = 0;
const KIND_INT_ARRAY: u8 = 1;

/// Errors reading or writing a module image
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    /// Input does not start with the module magic
    #[error("Bad magic: not a module image")]
    BadMagic,

    /// Format version this codec does not understand
    #[error("Unsupported module format version {0}")]
    UnsupportedVersion(u16),

    /// Input ended in the middle of a structure
    #[error("Unexpected end of input at offset {offset}")]
    UnexpectedEof {
        /// Byte offset
        offset: usize,
    },

    /// String constant is not UTF-8
    #[error("Invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 {
        /// Byte offset
        offset: usize,
    },

    /// Opcode outside the instruction set
    #[error("Unknown opcode 0x{opcode:02x} at offset {offset}")]
    UnknownOpcode {
        /// Opcode byte
        opcode: u8,
        /// Byte offset
        offset: usize,
    },

    /// Field kind outside the known set
    #[error("Unknown field kind {kind} at offset {offset}")]
    UnknownFieldKind {
        /// Kind byte
        kind: u8,
        /// Byte offset
        offset: usize,
    },

    /// Bytes left over after the last method
    #[error("{count} trailing bytes after module image")]
    TrailingBytes {
        /// Number of unread bytes
        count: usize,
    },

    /// A table outgrew its length prefix
    #[error("Too many {what}: {count}")]
    TooMany {
        /// What overflowed
        what: &'static str,
        /// Actual count
        count: usize,
    },
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FormatError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(FormatError::UnexpectedEof { offset: self.pos })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FormatError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, FormatError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, FormatError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, FormatError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn label(&mut self) -> Result<Label, FormatError> {
        self.u16().map(Label)
    }

    fn str(&mut self) -> Result<String, FormatError> {
        let len = self.u16()? as usize;
        let offset = self.pos;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| FormatError::InvalidUtf8 { offset })
    }

    const fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

/// Decode a module image, rejecting anything but a canonical encoding
pub fn decode(bytes: &[u8]) -> Result<ModuleImage, FormatError> {
    let mut r = Reader::new(bytes);

    if r.take(MAGIC.len()).map_err(|_| FormatError::BadMagic)? != MAGIC {
        return Err(FormatError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(FormatError::UnsupportedVersion(version));
    }

    let name = r.str()?;
    let super_name = Some(r.str()?).filter(|s| !s.is_empty());

    let interface_count = r.u16()?;
    let interfaces = (0..interface_count)
        .map(|_| r.str())
        .collect::<Result<Vec<_>, _>>()?;

    let field_count = r.u16()?;
    let mut fields = Vec::with_capacity(field_count as usize);
    for _ in 0..field_count {
        let name = r.str()?;
        let offset = r.pos;
        let kind = match r.u8()? {
            KIND_INT => FieldKind::Int,
            KIND_INT_ARRAY => FieldKind::IntArray(r.u32()?),
            kind => return Err(FormatError::UnknownFieldKind { kind, offset }),
        };
        let flags = r.u8()?;
        fields.push(Field { name, kind, flags });
    }

    let method_count = r.u16()?;
    let mut methods = Vec::with_capacity(method_count as usize);
    for _ in 0..method_count {
        let name = r.str()?;
        let flags = r.u8()?;
        let max_locals = r.u16()?;
        let code_len = r.u32()?;
        let mut code = Vec::new();
        for _ in 0..code_len {
            code.push(decode_instruction(&mut r)?);
        }
        methods.push(Method {
            name,
            flags,
            max_locals,
            code,
        });
    }

    if r.remaining() > 0 {
        return Err(FormatError::TrailingBytes {
            count: r.remaining(),
        });
    }

    Ok(ModuleImage {
        name,
        super_name,
        interfaces,
        fields,
        methods,
    })
}

fn decode_instruction(r: &mut Reader<'_>) -> Result<Instruction, FormatError> {
    let offset = r.pos;
    let insn = match r.u8()? {
        op::NOP => Instruction::Nop,
        op::PUSH => Instruction::Push(r.i32()?),
        op::LDC => Instruction::Ldc(r.str()?),
        op::LOAD => Instruction::Load(r.u16()?),
        op::STORE => Instruction::Store(r.u16()?),
        op::ADD => Instruction::Add,
        op::SUB => Instruction::Sub,
        op::MUL => Instruction::Mul,
        op::DIV => Instruction::Div,
        op::LINE => Instruction::Line(r.u32()?),
        op::LABEL => Instruction::Label(r.label()?),
        op::GOTO => Instruction::Goto(r.label()?),
        op::IFZERO => Instruction::IfZero(r.label()?),
        op::IFNONZERO => Instruction::IfNonZero(r.label()?),
        op::IFLT => Instruction::IfLt(r.label()?),
        op::IFGE => Instruction::IfGe(r.label()?),
        op::JSR => Instruction::Jsr(r.label()?),
        op::RET => Instruction::Ret(r.u16()?),
        op::INVOKE => Instruction::Invoke {
            owner: r.str()?,
            method: r.str()?,
        },
        op::NEW => Instruction::New(r.str()?),
        op::GETSTATIC => Instruction::GetStatic {
            owner: r.str()?,
            field: r.str()?,
        },
        op::PUTSTATIC => Instruction::PutStatic {
            owner: r.str()?,
            field: r.str()?,
        },
        op::ARRAYINC => Instruction::ArrayInc,
        op::RETURN => Instruction::Return,
        op::RETURNVALUE => Instruction::ReturnValue,
        opcode => return Err(FormatError::UnknownOpcode { opcode, offset }),
    };
    Ok(insn)
}

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.out.extend_from_slice(&v.to_be_bytes());
    }

    fn count(&mut self, what: &'static str, n: usize) -> Result<(), FormatError> {
        let n = u16::try_from(n).map_err(|_| FormatError::TooMany { what, count: n })?;
        self.u16(n);
        Ok(())
    }

    fn str(&mut self, s: &str) -> Result<(), FormatError> {
        self.count("string bytes", s.len())?;
        self.out.extend_from_slice(s.as_bytes());
        Ok(())
    }

    fn op_label(&mut self, opcode: u8, label: Label) {
        self.u8(opcode);
        self.u16(label.0);
    }
}

/// Encode a module image
pub fn encode(image: &ModuleImage) -> Result<Vec<u8>, FormatError> {
    let mut w = Writer { out: Vec::new() };
    w.out.extend_from_slice(&MAGIC);
    w.u16(VERSION);
    w.str(&image.name)?;
    w.str(image.super_name.as_deref().unwrap_or(""))?;

    w.count("interfaces", image.interfaces.len())?;
    for interface in &image.interfaces {
        w.str(interface)?;
    }

    w.count("fields", image.fields.len())?;
    for field in &image.fields {
        w.str(&field.name)?;
        match field.kind {
            FieldKind::Int => w.u8(KIND_INT),
            FieldKind::IntArray(len) => {
                w.u8(KIND_INT_ARRAY);
                w.u32(len);
            }
        }
        w.u8(field.flags);
    }

    w.count("methods", image.methods.len())?;
    for method in &image.methods {
        w.str(&method.name)?;
        w.u8(method.flags);
        w.u16(method.max_locals);
        let code_len = u32::try_from(method.code.len()).map_err(|_| FormatError::TooMany {
            what: "instructions",
            count: method.code.len(),
        })?;
        w.u32(code_len);
        for insn in &method.code {
            encode_instruction(&mut w, insn)?;
        }
    }

    Ok(w.out)
}

fn encode_instruction(w: &mut Writer, insn: &Instruction) -> Result<(), FormatError> {
    match insn {
        Instruction::Nop => w.u8(op::NOP),
        Instruction::Push(v) => {
            w.u8(op::PUSH);
            w.i32(*v);
        }
        Instruction::Ldc(s) => {
            w.u8(op::LDC);
            w.str(s)?;
        }
        Instruction::Load(l) => {
            w.u8(op::LOAD);
            w.u16(*l);
        }
        Instruction::Store(l) => {
            w.u8(op::STORE);
            w.u16(*l);
        }
        Instruction::Add => w.u8(op::ADD),
        Instruction::Sub => w.u8(op::SUB),
        Instruction::Mul => w.u8(op::MUL),
        Instruction::Div => w.u8(op::DIV),
        Instruction::Line(n) => {
            w.u8(op::LINE);
            w.u32(*n);
        }
        Instruction::Label(l) => w.op_label(op::LABEL, *l),
        Instruction::Goto(l) => w.op_label(op::GOTO, *l),
        Instruction::IfZero(l) => w.op_label(op::IFZERO, *l),
        Instruction::IfNonZero(l) => w.op_label(op::IFNONZERO, *l),
        Instruction::IfLt(l) => w.op_label(op::IFLT, *l),
        Instruction::IfGe(l) => w.op_label(op::IFGE, *l),
        Instruction::Jsr(l) => w.op_label(op::JSR, *l),
        Instruction::Ret(l) => {
            w.u8(op::RET);
            w.u16(*l);
        }
        Instruction::Invoke { owner, method } => {
            w.u8(op::INVOKE);
            w.str(owner)?;
            w.str(method)?;
        }
        Instruction::New(module) => {
            w.u8(op::NEW);
            w.str(module)?;
        }
        Instruction::GetStatic { owner, field } => {
            w.u8(op::GETSTATIC);
            w.str(owner)?;
            w.str(field)?;
        }
        Instruction::PutStatic { owner, field } => {
            w.u8(op::PUTSTATIC);
            w.str(owner)?;
            w.str(field)?;
        }
        Instruction::ArrayInc => w.u8(op::ARRAYINC),
        Instruction::Return => w.u8(op::RETURN),
        Instruction::ReturnValue => w.u8(op::RETURNVALUE),
    }
    Ok(())
}
