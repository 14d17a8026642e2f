//! Bounded instruction-stream walker
//!
//! Decodes forward from a start address and hands every instruction to a
//! visitor. Branch and call targets go on a work stack instead of being
//! disassembled linearly, so a walk explores the control-flow graph the
//! visitor asks for. A visited set and a mandatory instruction budget
//! guarantee termination.

use super::decoder::{decode_at, Flow, Instruction};
use crate::memory::ModuleImage;

use std::collections::HashSet;
use tracing::trace;

/// Visitor verdict for one instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Apply the walk's default branch and call policy
    Continue,
    /// Never take this instruction's target; continue after it
    StepOver,
    /// Queue this instruction's target regardless of policy
    Recurse,
    /// End the walk here
    Stop,
}

#[derive(Debug, Clone, Copy)]
pub struct WalkOptions {
    pub max_instructions: usize,
    /// Queue direct call targets on `Continue`
    pub follow_calls: bool,
    /// Queue conditional branch targets on `Continue`
    pub follow_branches: bool,
}

impl WalkOptions {
    pub fn new(max_instructions: usize) -> Self {
        Self {
            max_instructions,
            follow_calls: false,
            follow_branches: true,
        }
    }

    pub fn follow_calls(mut self, follow: bool) -> Self {
        self.follow_calls = follow;
        self
    }

    pub fn follow_branches(mut self, follow: bool) -> Self {
        self.follow_branches = follow;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOutcome {
    /// Visitor returned `Stop` at this address
    Stopped { at: usize, visited: usize },
    /// Every reachable path ended
    Exhausted { visited: usize },
    /// Budget ran out with work remaining
    BudgetExceeded { visited: usize },
}

impl WalkOutcome {
    pub fn visited(&self) -> usize {
        match *self {
            WalkOutcome::Stopped { visited, .. }
            | WalkOutcome::Exhausted { visited }
            | WalkOutcome::BudgetExceeded { visited } => visited,
        }
    }

    pub fn stopped_at(&self) -> Option<usize> {
        match *self {
            WalkOutcome::Stopped { at, .. } => Some(at),
            _ => None,
        }
    }
}

pub struct Walker<'a> {
    image: &'a ModuleImage,
    options: WalkOptions,
}

impl<'a> Walker<'a> {
    pub fn new(image: &'a ModuleImage, options: WalkOptions) -> Self {
        Self { image, options }
    }

    pub fn walk<F>(&self, start: usize, mut visitor: F) -> WalkOutcome
    where
        F: FnMut(&Instruction) -> Visit,
    {
        let mut pending = vec![start];
        let mut seen = HashSet::new();
        let mut visited = 0;

        while let Some(path_start) = pending.pop() {
            let mut cursor = path_start;

            while self.image.contains(cursor) && seen.insert(cursor) {
                if visited >= self.options.max_instructions {
                    return WalkOutcome::BudgetExceeded { visited };
                }

                let insn = match decode_at(self.image.view(), cursor) {
                    Ok(insn) => insn,
                    Err(e) => {
                        trace!("walk path ends at {:#x}: {}", cursor, e);
                        break;
                    }
                };
                visited += 1;

                let verdict = visitor(&insn);
                if verdict == Visit::Stop {
                    return WalkOutcome::Stopped { at: cursor, visited };
                }

                let target = insn
                    .branch_target()
                    .filter(|&t| self.image.contains(t));

                match insn.flow() {
                    Flow::Return | Flow::IndirectJump | Flow::Interrupt => break,
                    Flow::Jump => match (verdict, target) {
                        (Visit::StepOver, _) | (_, None) => break,
                        (_, Some(t)) => {
                            cursor = t;
                            continue;
                        }
                    },
                    Flow::Call => {
                        if let Some(t) = target {
                            if self.should_queue(verdict, self.options.follow_calls) {
                                pending.push(t);
                            }
                        }
                    }
                    Flow::ConditionalJump => {
                        if let Some(t) = target {
                            if self.should_queue(verdict, self.options.follow_branches) {
                                pending.push(t);
                            }
                        }
                    }
                    Flow::Sequential | Flow::IndirectCall => {}
                }

                cursor = insn.next_address();
            }
        }

        WalkOutcome::Exhausted { visited }
    }

    fn should_queue(&self, verdict: Visit, default: bool) -> bool {
        match verdict {
            Visit::Recurse => true,
            Visit::StepOver => false,
            _ => default,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disasm::Mnemonic;
    use crate::memory::{MemoryView, MockMemorySource};

    const BASE: usize = 0x400000;

    fn image(code: Vec<u8>) -> ModuleImage {
        let len = code.len();
        let view = MemoryView::from_source(MockMemorySource::with_code_region(code, BASE));
        ModuleImage::new(view, BASE, len)
    }

    fn rel32(from_next: usize, to: usize) -> [u8; 4] {
        ((to as i64 - from_next as i64) as i32).to_le_bytes()
    }

    #[test]
    fn test_walk_stops_on_budget_in_infinite_loop() {
        // 64 nops then jmp back to the start
        let mut code = vec![0x90u8; 64];
        code.extend_from_slice(&[0xE9]);
        code.extend_from_slice(&rel32(BASE + 69, BASE));
        let image = image(code);

        let outcome = Walker::new(&image, WalkOptions::new(16)).walk(BASE, |_| Visit::Continue);
        assert_eq!(outcome, WalkOutcome::BudgetExceeded { visited: 16 });
    }

    #[test]
    fn test_walk_terminates_on_loop_with_large_budget() {
        let image = image(vec![0x90, 0x90, 0xEB, 0xFC]);
        let outcome =
            Walker::new(&image, WalkOptions::new(1000)).walk(BASE, |_| Visit::Continue);
        assert_eq!(outcome, WalkOutcome::Exhausted { visited: 3 });
    }

    #[test]
    fn test_walk_follows_conditional_branches_by_default() {
        // 0: jz +3 -> 5 ; 2: nop ; 3: nop ; 4: ret ; 5: int3
        let image = image(vec![0x74, 0x03, 0x90, 0x90, 0xC3, 0xCC]);
        let mut seen = Vec::new();
        let outcome = Walker::new(&image, WalkOptions::new(100)).walk(BASE, |insn| {
            seen.push(insn.address() - BASE);
            Visit::Continue
        });
        assert_eq!(outcome.visited(), 5);
        assert_eq!(seen, vec![0, 2, 3, 4, 5]);

        let mut seen = Vec::new();
        Walker::new(&image, WalkOptions::new(100).follow_branches(false)).walk(BASE, |insn| {
            seen.push(insn.address() - BASE);
            Visit::Continue
        });
        assert_eq!(seen, vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_walk_verdicts_on_calls() {
        // 0: call 7 ; 5: nop ; 6: ret ; 7: int3 (callee)
        let mut code = vec![0xE8];
        code.extend_from_slice(&rel32(BASE + 5, BASE + 7));
        code.extend_from_slice(&[0x90, 0xC3, 0xCC]);
        let image = image(code);

        let collect = |options: WalkOptions, verdict: Visit| {
            let mut seen = Vec::new();
            Walker::new(&image, options).walk(BASE, |insn| {
                seen.push(insn.address() - BASE);
                if insn.mnemonic() == Mnemonic::Call {
                    verdict
                } else {
                    Visit::Continue
                }
            });
            seen
        };

        assert_eq!(collect(WalkOptions::new(50), Visit::Continue), vec![0, 5, 6]);
        assert_eq!(
            collect(WalkOptions::new(50).follow_calls(true), Visit::Continue),
            vec![0, 5, 6, 7]
        );
        assert_eq!(
            collect(WalkOptions::new(50).follow_calls(true), Visit::StepOver),
            vec![0, 5, 6]
        );
        assert_eq!(collect(WalkOptions::new(50), Visit::Recurse), vec![0, 5, 6, 7]);
    }

    #[test]
    fn test_walk_stop_reports_address() {
        let image = image(vec![0x90, 0x90, 0xC3]);
        let outcome = Walker::new(&image, WalkOptions::new(50)).walk(BASE, |insn| {
            if insn.address() == BASE + 1 {
                Visit::Stop
            } else {
                Visit::Continue
            }
        });
        assert_eq!(outcome.stopped_at(), Some(BASE + 1));
        assert_eq!(outcome.visited(), 2);
    }

    #[test]
    fn test_walk_ignores_targets_outside_image() {
        // jmp far outside the image ends the path
        let image = image(vec![0xE9, 0x00, 0x00, 0x00, 0x10]);
        let outcome =
            Walker::new(&image, WalkOptions::new(50)).walk(BASE, |_| Visit::Continue);
        assert_eq!(outcome, WalkOutcome::Exhausted { visited: 1 });
    }
}
