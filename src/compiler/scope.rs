//! Lexical blocks, goto/label resolution and local-variable lifetimes.
//!
//! Gotos (including `break`, a pseudo-label) are collected per function and
//! resolved either when a matching label appears or when they migrate out of
//! a closing block; whichever resolves them patches their jump. A goto still
//! pending when the outermost block closes is an error.

use crate::compiler::code::FuncState;
use crate::compiler::Result;
use crate::proto::LocalVar;

/// Locals per function (and per expansion of a vararg list).
pub const MAX_LOCAL_VARS: usize = 200;
/// Upvalues per function, bounded by the B operand of GETUPVAL.
pub const MAX_UPVALUES: usize = 255;

/// One lexical block.
#[derive(Clone, Copy, Debug)]
pub struct Block {
    /// Index of the first label declared in this block.
    pub first_label: usize,
    /// Index of the first pending goto made in this block.
    pub first_goto: usize,
    /// Number of active locals outside this block.
    pub nactive: u32,
    /// Some local of this block is captured as an upvalue.
    pub has_upval: bool,
    /// `break` may target this block.
    pub is_loop: bool,
}

/// A declared label, or a pending goto waiting for one.
#[derive(Clone, Debug)]
pub struct Label {
    pub name: String,
    /// Position of the label, or of the goto's JMP.
    pub pc: i32,
    pub line: u32,
    /// Active locals at the declaration point.
    pub nactive: u32,
}

impl FuncState {
    pub fn enter_block(&mut self, is_loop: bool) {
        debug_assert_eq!(self.free_reg, self.nactive);
        self.blocks.push(Block {
            first_label: self.active_labels.len(),
            first_goto: self.pending_gotos.len(),
            nactive: self.nactive,
            has_upval: false,
            is_loop,
        });
    }

    pub fn leave_block(&mut self) -> Result<()> {
        let bl = *self.blocks.last().expect("no block to leave");
        if self.blocks.len() > 1 && bl.has_upval {
            // Create a jump to here that closes the block's upvalues.
            let j = self.jump()?;
            self.patch_close(j, bl.nactive)?;
            self.patch_to_here(j)?;
        }
        if bl.is_loop {
            self.break_label()?;
        }
        self.blocks.pop();
        self.remove_local_vars(bl.nactive);
        debug_assert_eq!(bl.nactive, self.nactive);
        self.free_reg = self.nactive;
        self.active_labels.truncate(bl.first_label);
        if !self.blocks.is_empty() {
            self.move_gotos_out(bl)
        } else if bl.first_goto < self.pending_gotos.len() {
            let gt = &self.pending_gotos[bl.first_goto];
            let msg = if gt.name == "break" {
                format!("<break> at line {} not inside a loop", gt.line)
            } else {
                format!("no visible label '{}' for <goto> at line {}", gt.name, gt.line)
            };
            Err(self.error(msg))
        } else {
            Ok(())
        }
    }

    // ---- Labels and gotos ----

    /// Declare a label at the current position. Returns its index.
    pub fn make_label(&mut self, name: &str, line: u32) -> usize {
        let pc = self.get_label();
        self.active_labels.push(Label {
            name: name.to_string(),
            pc,
            line,
            nactive: self.nactive,
        });
        self.active_labels.len() - 1
    }

    /// Record a goto (or break) whose jump was just emitted at `pc`.
    /// Resolves it immediately when its label is already visible.
    pub fn make_goto(&mut self, name: &str, line: u32, pc: i32) -> Result<()> {
        self.pending_gotos.push(Label {
            name: name.to_string(),
            pc,
            line,
            nactive: self.nactive,
        });
        self.find_label(self.pending_gotos.len() - 1)?;
        Ok(())
    }

    /// Try to resolve the pending goto at index `g` against the labels of
    /// the current block. Returns whether it was closed.
    pub fn find_label(&mut self, g: usize) -> Result<bool> {
        let bl = *self.blocks.last().expect("no active block");
        for i in bl.first_label..self.active_labels.len() {
            if self.active_labels[i].name != self.pending_gotos[g].name {
                continue;
            }
            let label = self.active_labels[i].clone();
            let gt_nactive = self.pending_gotos[g].nactive;
            if gt_nactive > label.nactive
                && (bl.has_upval || self.active_labels.len() > bl.first_label)
            {
                self.patch_close(self.pending_gotos[g].pc, label.nactive)?;
            }
            self.close_goto(g, &label)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Resolve every pending goto of the current block naming `label`.
    pub fn find_gotos(&mut self, label: usize) -> Result<()> {
        let label = self.active_labels[label].clone();
        let mut i = self.blocks.last().expect("no active block").first_goto;
        while i < self.pending_gotos.len() {
            if self.pending_gotos[i].name == label.name {
                self.close_goto(i, &label)?;
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    /// Patch the goto at index `g` to `label` and drop it from the pending
    /// list. Jumping into the scope of a local is an error.
    fn close_goto(&mut self, g: usize, label: &Label) -> Result<()> {
        let gt = self.pending_gotos[g].clone();
        debug_assert_eq!(gt.name, label.name);
        if gt.nactive < label.nactive {
            let var = self.local_var_name(gt.nactive);
            return Err(self.error(format!(
                "<goto {}> at line {} jumps into the scope of local '{}'",
                gt.name, gt.line, var
            )));
        }
        self.patch_list(gt.pc, label.pc)?;
        self.pending_gotos.remove(g);
        Ok(())
    }

    /// Close pending breaks of a finished loop against an implicit label at
    /// the current position.
    fn break_label(&mut self) -> Result<()> {
        let l = self.active_labels.len();
        self.active_labels.push(Label {
            name: "break".to_string(),
            pc: self.pc(),
            line: 0,
            nactive: self.nactive,
        });
        self.find_gotos(l)
    }

    /// Migrate the pending gotos of a closed block to the enclosing one,
    /// resolving those whose label is now visible.
    fn move_gotos_out(&mut self, bl: Block) -> Result<()> {
        let mut i = bl.first_goto;
        while i < self.pending_gotos.len() {
            if self.pending_gotos[i].nactive > bl.nactive {
                if bl.has_upval {
                    self.patch_close(self.pending_gotos[i].pc, bl.nactive)?;
                }
                self.pending_gotos[i].nactive = bl.nactive;
            }
            if !self.find_label(i)? {
                i += 1;
            }
        }
        Ok(())
    }

    /// A label name may not repeat within one block.
    pub fn check_repeated_label(&mut self, name: &str) -> Result<()> {
        let first = self.blocks.last().expect("no active block").first_label;
        for label in &self.active_labels[first..] {
            if label.name == name {
                return Err(self.error(format!(
                    "label '{}' already defined on line {}",
                    name, label.line
                )));
            }
        }
        Ok(())
    }

    // ---- Local variables ----

    /// Declare a local variable. It occupies a register slot only once
    /// activated by [`adjust_local_vars`].
    pub fn make_local_var(&mut self, name: &str) -> Result<()> {
        if self.active_vars.len() >= MAX_LOCAL_VARS {
            return Err(self.error("too many local variables"));
        }
        let idx = self.proto.local_vars.len();
        self.proto.local_vars.push(LocalVar {
            name: name.to_string(),
            start_pc: 0,
            end_pc: 0,
        });
        self.active_vars.push(idx);
        Ok(())
    }

    /// Bring the last `n` declared locals into scope, starting now.
    pub fn adjust_local_vars(&mut self, n: u32) {
        let pc = self.pc() as u32;
        self.nactive += n;
        for i in (self.nactive - n)..self.nactive {
            let idx = self.active_vars[i as usize];
            self.proto.local_vars[idx].start_pc = pc;
        }
    }

    /// Take all locals above `to_level` out of scope, closing their debug
    /// ranges at the current position.
    pub fn remove_local_vars(&mut self, to_level: u32) {
        let pc = self.pc() as u32;
        while self.nactive > to_level {
            self.nactive -= 1;
            let idx = self.active_vars.pop().expect("active variable underflow");
            self.proto.local_vars[idx].end_pc = pc;
        }
    }

    /// Register of the named active local, searching innermost first.
    pub fn search_local(&self, name: &str) -> Option<u32> {
        for i in (0..self.nactive).rev() {
            let idx = self.active_vars[i as usize];
            if self.proto.local_vars[idx].name == name {
                return Some(i);
            }
        }
        None
    }

    /// Name of the active local occupying register `reg`.
    pub fn local_var_name(&self, reg: u32) -> String {
        let idx = self.active_vars[reg as usize];
        self.proto.local_vars[idx].name.clone()
    }

    // ---- Upvalues ----

    pub fn search_upvalue(&self, name: &str) -> Option<u32> {
        self.proto
            .upvalues
            .iter()
            .position(|u| u.name == name)
            .map(|i| i as u32)
    }

    pub fn make_upvalue(&mut self, name: &str, in_stack: bool, index: u32) -> Result<u32> {
        if self.proto.upvalues.len() >= MAX_UPVALUES {
            return Err(self.error("too many upvalues"));
        }
        self.proto.upvalues.push(crate::proto::UpvalDesc {
            name: name.to_string(),
            in_stack,
            index,
        });
        Ok(self.proto.upvalues.len() as u32 - 1)
    }

    /// Mark the innermost block containing the local at `level` as having a
    /// captured variable, so leaving it emits an upvalue-closing jump.
    pub fn mark_block_upvalue(&mut self, level: u32) {
        for bl in self.blocks.iter_mut().rev() {
            if bl.nactive <= level {
                bl.has_upval = true;
                return;
            }
        }
        debug_assert!(false, "no block contains local {level}");
    }
}
