//! Program counter, call stack and operand decoding shared by the three
//! interpreter levels.
//!
//! Operands are big-endian. Absolute targets are offsets from the start
//! of the sequence; relative jumps are signed bytes from the end of the
//! jump instruction.

use cadence_shared::constants::SCRIPT_STACK_DEPTH;

use super::ScriptError;

/// Execution state of one script: where it is and how it got there.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScriptState {
    pc: usize,
    depth: usize,
    stack: [usize; SCRIPT_STACK_DEPTH],
    loops: [u8; SCRIPT_STACK_DEPTH],
}

impl ScriptState {
    /// A script starting at `pc` with an empty stack.
    #[inline]
    #[must_use]
    pub const fn at(pc: usize) -> Self {
        Self {
            pc,
            depth: 0,
            stack: [0; SCRIPT_STACK_DEPTH],
            loops: [0; SCRIPT_STACK_DEPTH],
        }
    }

    /// Offset of the next instruction byte.
    #[inline]
    #[must_use]
    pub const fn pc(&self) -> usize {
        self.pc
    }

    /// Number of live call and loop frames.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// [`ScriptError::PcOutOfBounds`] past the end of `data`.
    #[inline]
    pub fn read_u8(&mut self, data: &[u8]) -> Result<u8, ScriptError> {
        let byte = *data
            .get(self.pc)
            .ok_or(ScriptError::PcOutOfBounds { pc: self.pc })?;
        self.pc += 1;
        Ok(byte)
    }

    /// Reads one signed byte.
    ///
    /// # Errors
    ///
    /// As [`ScriptState::read_u8`].
    #[inline]
    pub fn read_s8(&mut self, data: &[u8]) -> Result<i8, ScriptError> {
        self.read_u8(data).map(|byte| i8::from_be_bytes([byte]))
    }

    /// Reads a big-endian u16.
    ///
    /// # Errors
    ///
    /// As [`ScriptState::read_u8`].
    #[inline]
    pub fn read_u16(&mut self, data: &[u8]) -> Result<u16, ScriptError> {
        let hi = self.read_u8(data)?;
        let lo = self.read_u8(data)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Reads a big-endian i16.
    ///
    /// # Errors
    ///
    /// As [`ScriptState::read_u8`].
    #[inline]
    pub fn read_s16(&mut self, data: &[u8]) -> Result<i16, ScriptError> {
        self.read_u16(data).map(|word| i16::from_be_bytes(word.to_be_bytes()))
    }

    /// Reads a variable-length u16: one byte below 0x80, otherwise two
    /// bytes with the top bit of the first one cleared.
    ///
    /// # Errors
    ///
    /// As [`ScriptState::read_u8`].
    pub fn read_compressed(&mut self, data: &[u8]) -> Result<u16, ScriptError> {
        let first = self.read_u8(data)?;
        if first & 0x80 == 0 {
            return Ok(u16::from(first));
        }
        let second = self.read_u8(data)?;
        Ok(u16::from(first & 0x7f) << 8 | u16::from(second))
    }

    /// Continues at absolute offset `target`.
    #[inline]
    pub fn jump(&mut self, target: u16) {
        self.pc = usize::from(target);
    }

    /// Moves the program counter by `offset` bytes.
    ///
    /// # Errors
    ///
    /// [`ScriptError::PcOutOfBounds`] if the target is before the start.
    pub fn jump_relative(&mut self, offset: i8) -> Result<(), ScriptError> {
        self.pc = self
            .pc
            .checked_add_signed(isize::from(offset))
            .ok_or(ScriptError::PcOutOfBounds { pc: self.pc })?;
        Ok(())
    }

    /// Pushes the return address and continues at `target`.
    ///
    /// # Errors
    ///
    /// [`ScriptError::StackOverflow`] when every frame is in use.
    pub fn call(&mut self, target: u16) -> Result<(), ScriptError> {
        self.push(0)?;
        self.jump(target);
        Ok(())
    }

    /// Pops a call frame.
    ///
    /// Returns false when the script is at its top level, meaning the
    /// end instruction finishes the script.
    #[must_use]
    pub fn ret(&mut self) -> bool {
        if self.depth == 0 {
            return false;
        }
        self.depth -= 1;
        self.pc = self.stack[self.depth];
        true
    }

    /// Opens a loop of `count` iterations (0 means 256) over the code that
    /// follows.
    ///
    /// # Errors
    ///
    /// [`ScriptError::StackOverflow`] when every frame is in use.
    pub fn loop_start(&mut self, count: u8) -> Result<(), ScriptError> {
        self.push(count)
    }

    /// Closes the innermost loop: jumps back while iterations remain.
    ///
    /// # Errors
    ///
    /// [`ScriptError::StackUnderflow`] with no open loop.
    pub fn loop_end(&mut self) -> Result<(), ScriptError> {
        let top = self
            .depth
            .checked_sub(1)
            .ok_or(ScriptError::StackUnderflow { pc: self.pc })?;
        self.loops[top] = self.loops[top].wrapping_sub(1);
        if self.loops[top] == 0 {
            self.depth = top;
        } else {
            self.pc = self.stack[top];
        }
        Ok(())
    }

    /// Drops the innermost frame without jumping.
    ///
    /// # Errors
    ///
    /// [`ScriptError::StackUnderflow`] on an empty stack.
    pub fn break_loop(&mut self) -> Result<(), ScriptError> {
        self.depth = self
            .depth
            .checked_sub(1)
            .ok_or(ScriptError::StackUnderflow { pc: self.pc })?;
        Ok(())
    }

    fn push(&mut self, count: u8) -> Result<(), ScriptError> {
        if self.depth >= SCRIPT_STACK_DEPTH {
            return Err(ScriptError::StackOverflow { pc: self.pc });
        }
        self.stack[self.depth] = self.pc;
        self.loops[self.depth] = count;
        self.depth += 1;
        Ok(())
    }
}

/// Reads a big-endian u16 at `offset` of `data`.
#[inline]
#[must_use]
pub fn peek_u16(data: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    let bytes = data.get(offset..end)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
