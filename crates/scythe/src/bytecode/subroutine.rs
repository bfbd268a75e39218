//! Subroutine inlining
//!
//! `jsr`/`ret` pairs let several call sites share one body, which breaks the
//! basic-block view the coverage stages rely on. This pass copies each
//! subroutine body into every call site with fresh labels, turns every `ret`
//! into a jump to the call's continuation, and drops the shared bodies.
//!
//! A body is every instruction reachable from the subroutine's label,
//! following fall-through and jumps and stopping at `ret` or `return`, so a
//! subroutine may have several exits.

use super::{FormatError, Instruction, Label, LabelAllocator, Method, ModuleImage};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

/// Errors raised while inlining subroutines
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubroutineError {
    /// `jsr` to a label the method never defines
    #[error("Subroutine entry {0} is not defined")]
    MissingEntry(Label),

    /// Subroutine body with no reachable `ret`, or one running off the method
    #[error("Subroutine at {0} has no ret")]
    Unterminated(Label),

    /// Subroutine that calls itself, directly or not
    #[error("Subroutine at {0} is recursive")]
    Recursive(Label),

    /// Two subroutine bodies share instructions
    #[error("Subroutine at {0} overlaps another subroutine")]
    Overlapping(Label),

    /// `ret` outside any subroutine body
    #[error("ret at instruction {index} is outside any subroutine")]
    StrayRet {
        /// Instruction index
        index: usize,
    },

    /// Code outside a subroutine jumps into its body
    #[error("Jump to {0} targets a removed subroutine body")]
    DanglingLabel(Label),

    /// Label space exhausted
    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Inline subroutines of every method; returns how many methods changed
pub fn inline_module(image: &mut ModuleImage) -> Result<usize, SubroutineError> {
    let mut changed = 0;
    for method in &mut image.methods {
        if inline_subroutines(method)? {
            changed += 1;
        }
    }
    Ok(changed)
}

/// Inline the subroutines of one method; returns whether it changed
pub fn inline_subroutines(method: &mut Method) -> Result<bool, SubroutineError> {
    if !method.has_subroutines() {
        return Ok(false);
    }

    let bodies = find_bodies(&method.code)?;
    let in_body: BTreeSet<usize> = bodies.values().flatten().copied().collect();
    let mut inliner = Inliner {
        code: &method.code,
        bodies: &bodies,
        labels: method.label_allocator(),
        active: Vec::new(),
    };

    let mut out = Vec::with_capacity(method.code.len());
    for (index, insn) in method.code.iter().enumerate() {
        if in_body.contains(&index) {
            continue;
        }
        match insn {
            Instruction::Jsr(entry) => inliner.expand(*entry, &mut out)?,
            Instruction::Ret(_) => return Err(SubroutineError::StrayRet { index }),
            other => out.push(other.clone()),
        }
    }

    check_targets(&out)?;
    method.code = out;
    Ok(true)
}

/// Instruction indices of every `jsr` target's body, in code order
fn find_bodies(code: &[Instruction]) -> Result<BTreeMap<Label, Vec<usize>>, SubroutineError> {
    let positions: HashMap<Label, usize> = code
        .iter()
        .enumerate()
        .filter_map(|(i, insn)| match insn {
            Instruction::Label(l) => Some((*l, i)),
            _ => None,
        })
        .collect();

    let mut bodies = BTreeMap::new();
    for insn in code {
        let Instruction::Jsr(entry) = insn else {
            continue;
        };
        if bodies.contains_key(entry) {
            continue;
        }
        let start = *positions
            .get(entry)
            .ok_or(SubroutineError::MissingEntry(*entry))?;
        bodies.insert(*entry, reachable_body(code, &positions, *entry, start)?);
    }

    let mut owner: HashMap<usize, Label> = HashMap::new();
    for (entry, body) in &bodies {
        for index in body {
            if owner.insert(*index, *entry).is_some() {
                return Err(SubroutineError::Overlapping(*entry));
            }
        }
    }

    Ok(bodies)
}

fn reachable_body(
    code: &[Instruction],
    positions: &HashMap<Label, usize>,
    entry: Label,
    start: usize,
) -> Result<Vec<usize>, SubroutineError> {
    let mut visited = BTreeSet::new();
    let mut pending = vec![start];
    let mut returns = false;

    while let Some(index) = pending.pop() {
        if !visited.insert(index) {
            continue;
        }
        let insn = code.get(index).ok_or(SubroutineError::Unterminated(entry))?;
        match insn {
            Instruction::Ret(_) => {
                returns = true;
                continue;
            }
            Instruction::Return | Instruction::ReturnValue => continue,
            // a nested call comes back to the next instruction
            Instruction::Jsr(_) => {}
            other => {
                if let Some(target) = other.jump_target() {
                    let at = positions
                        .get(&target)
                        .ok_or(SubroutineError::DanglingLabel(target))?;
                    pending.push(*at);
                }
                if matches!(other, Instruction::Goto(_)) {
                    continue;
                }
            }
        }
        pending.push(index + 1);
    }

    if !returns {
        return Err(SubroutineError::Unterminated(entry));
    }
    Ok(visited.into_iter().collect())
}

struct Inliner<'a> {
    code: &'a [Instruction],
    bodies: &'a BTreeMap<Label, Vec<usize>>,
    labels: LabelAllocator,
    active: Vec<Label>,
}

impl Inliner<'_> {
    fn expand(&mut self, entry: Label, out: &mut Vec<Instruction>) -> Result<(), SubroutineError> {
        if self.active.contains(&entry) {
            return Err(SubroutineError::Recursive(entry));
        }
        let bodies = self.bodies;
        let code = self.code;
        let body: Vec<&Instruction> = bodies
            .get(&entry)
            .ok_or(SubroutineError::MissingEntry(entry))?
            .iter()
            .map(|index| &code[*index])
            .collect();

        let mut renamed = HashMap::new();
        for insn in &body {
            if let Instruction::Label(l) = insn {
                renamed.insert(*l, self.labels.fresh()?);
            }
        }
        let continuation = self.labels.fresh()?;

        self.active.push(entry);
        // stands in for the return address the body stores away
        out.push(Instruction::Push(0));
        // bodies are copied in code order; enter at the label if it is not first
        if body.first() != Some(&&Instruction::Label(entry)) {
            out.push(Instruction::Goto(renamed[&entry]));
        }
        for insn in body {
            match insn {
                Instruction::Label(l) => out.push(Instruction::Label(renamed[l])),
                Instruction::Ret(_) => out.push(Instruction::Goto(continuation)),
                Instruction::Jsr(nested) => self.expand(*nested, out)?,
                other => match other.jump_target().and_then(|t| renamed.get(&t)) {
                    Some(target) => out.push(other.retarget(*target)),
                    None => out.push(other.clone()),
                },
            }
        }
        out.push(Instruction::Label(continuation));
        self.active.pop();
        Ok(())
    }
}

fn check_targets(code: &[Instruction]) -> Result<(), SubroutineError> {
    let defined: Vec<Label> = code
        .iter()
        .filter_map(|insn| match insn {
            Instruction::Label(l) => Some(*l),
            _ => None,
        })
        .collect();
    match code
        .iter()
        .filter_map(Instruction::jump_target)
        .find(|t| !defined.contains(t))
    {
        Some(dangling) => Err(SubroutineError::DanglingLabel(dangling)),
        None => Ok(()),
    }
}
