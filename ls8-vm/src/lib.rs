//! LS-8 virtual machine
//!
//! An interpreter for a small 8-register CPU with 256 bytes of RAM, a
//! downward-growing hardware stack, and a flags register.  Instructions
//! are fixed-width byte sequences: an opcode byte followed by zero, one,
//! or two operand bytes.
//!
//! The VM core is deliberately minimal: it owns the machine state and
//! executes instructions, routing the `PRN` side effect through a
//! [`Device`] so that hosts decide what "output" means.
#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Number of addressable bytes of RAM
pub const RAM_SIZE: usize = 256;

/// Number of registers in the register file
pub const REG_COUNT: usize = 8;

/// Register reserved (by convention) as the stack pointer
pub const SP: u8 = 7;

/// Initial stack pointer value; the stack grows downward from here
///
/// A `POP` or `RET` with the stack pointer already at this address is a
/// [`Error::StackUnderflow`].
pub const STACK_TOP: u8 = 0xF4;

/// Flag bit set by [`Op::Cmp`] when the operands are equal
pub const FLAG_EQ: u8 = 1 << 0;

/// Flag bit set by [`Op::Cmp`] when the first operand is greater
pub const FLAG_GT: u8 = 1 << 1;

/// Flag bit set by [`Op::Cmp`] when the first operand is lesser
pub const FLAG_LT: u8 = 1 << 2;

/// LS-8 opcode
///
/// Every instruction is one of these thirteen shapes.  The high bits of
/// the encoded byte describe operand count and register use, but the
/// interpreter does not decode them structurally; bytes are matched
/// exactly in [`Op::from_byte`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Op {
    /// Halt
    ///
    /// ```text
    /// HLT
    /// ```
    ///
    /// Stops execution.  This is the only way a program terminates
    /// normally; the run loop reports it to the caller rather than
    /// exiting the process.
    Hlt,

    /// Load immediate
    ///
    /// ```text
    /// LDI reg value
    /// ```
    ///
    /// Stores the immediate byte `value` into `reg`.
    Ldi,

    /// Push
    ///
    /// ```text
    /// PUSH reg
    /// ```
    ///
    /// Decrements the stack pointer, then stores the value of `reg` at
    /// the address it now holds.
    Push,

    /// Pop
    ///
    /// ```text
    /// POP reg
    /// ```
    ///
    /// Loads the byte at the stack pointer into `reg`, then increments
    /// the stack pointer.
    Pop,

    /// Multiply
    ///
    /// ```text
    /// MUL regA regB
    /// ```
    ///
    /// `regA = regA * regB`, wrapping modulo 256.
    Mul,

    /// Add
    ///
    /// ```text
    /// ADD regA regB
    /// ```
    ///
    /// `regA = regA + regB`, wrapping modulo 256.
    Add,

    /// Print
    ///
    /// ```text
    /// PRN reg
    /// ```
    ///
    /// Sends the value of `reg` to the attached [`Device`].
    Prn,

    /// Call
    ///
    /// ```text
    /// CALL reg
    /// ```
    ///
    /// Pushes the address of the next instruction (the call's address
    /// plus two) onto the stack, then jumps to the address held in
    /// `reg`.
    Call,

    /// Return
    ///
    /// ```text
    /// RET
    /// ```
    ///
    /// Pops an address off the stack and jumps to it.
    Ret,

    /// Compare
    ///
    /// ```text
    /// CMP regA regB
    /// ```
    ///
    /// Replaces the flags register with exactly one of [`FLAG_EQ`],
    /// [`FLAG_LT`], or [`FLAG_GT`], per the ordering of `regA` against
    /// `regB`.
    Cmp,

    /// Jump
    ///
    /// ```text
    /// JMP reg
    /// ```
    ///
    /// Unconditionally jumps to the address held in `reg`.
    Jmp,

    /// Jump if not equal
    ///
    /// ```text
    /// JNE reg
    /// ```
    ///
    /// Jumps to the address held in `reg` if the equal flag is clear;
    /// otherwise falls through to the next instruction.
    Jne,

    /// Jump if equal
    ///
    /// ```text
    /// JEQ reg
    /// ```
    ///
    /// Jumps to the address held in `reg` if the equal flag is set;
    /// otherwise falls through to the next instruction.
    Jeq,
}

impl Op {
    /// Decodes an opcode byte, returning `None` for unassigned bytes
    pub const fn from_byte(b: u8) -> Option<Op> {
        let op = match b {
            0b0000_0001 => Op::Hlt,
            0b1000_0010 => Op::Ldi,
            0b0100_0101 => Op::Push,
            0b0100_0110 => Op::Pop,
            0b1010_0010 => Op::Mul,
            0b1010_0000 => Op::Add,
            0b0100_0111 => Op::Prn,
            0b0101_0000 => Op::Call,
            0b0001_0001 => Op::Ret,
            0b1010_0111 => Op::Cmp,
            0b0101_0100 => Op::Jmp,
            0b0101_0110 => Op::Jne,
            0b0101_0101 => Op::Jeq,
            _ => return None,
        };
        Some(op)
    }

    /// Returns the byte encoding this opcode; the inverse of
    /// [`Op::from_byte`]
    pub const fn byte(&self) -> u8 {
        match self {
            Op::Hlt => 0b0000_0001,
            Op::Ldi => 0b1000_0010,
            Op::Push => 0b0100_0101,
            Op::Pop => 0b0100_0110,
            Op::Mul => 0b1010_0010,
            Op::Add => 0b1010_0000,
            Op::Prn => 0b0100_0111,
            Op::Call => 0b0101_0000,
            Op::Ret => 0b0001_0001,
            Op::Cmp => 0b1010_0111,
            Op::Jmp => 0b0101_0100,
            Op::Jne => 0b0101_0110,
            Op::Jeq => 0b0101_0101,
        }
    }
}

/// Fatal execution error
///
/// None of these are recoverable; the run loop stops at the faulting
/// instruction and returns the error to the caller.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The fetched byte does not decode to any [`Op`]
    InvalidOpcode {
        /// Address the byte was fetched from
        pc: u8,
        /// The offending byte
        byte: u8,
    },

    /// A register index operand was outside the register file
    OutOfBounds {
        /// Address of the faulting instruction
        pc: u8,
        /// The offending index
        index: u8,
    },

    /// `POP` or `RET` executed with an empty stack
    StackUnderflow {
        /// Address of the faulting instruction
        pc: u8,
    },
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            Error::InvalidOpcode { pc, byte } => {
                write!(f, "invalid opcode {byte:#04x} at {pc:#04x}")
            }
            Error::OutOfBounds { pc, index } => {
                write!(f, "register index {index} out of bounds at {pc:#04x}")
            }
            Error::StackUnderflow { pc } => {
                write!(f, "stack underflow at {pc:#04x}")
            }
        }
    }
}

impl core::error::Error for Error {}

/// Trait for the machine's output peripheral
///
/// `PRN` is the only instruction with an externally visible side effect;
/// it hands the register value to whatever implements this trait.
pub trait Device {
    /// Receives one value from a `PRN` instruction
    fn print(&mut self, value: u8);
}

/// The virtual machine itself
///
/// All state is owned here and mutated in place by [`Cpu::step`]; there
/// is no hidden global.
pub struct Cpu {
    /// 256 bytes of RAM, shared by program, data, and stack
    ram: [u8; RAM_SIZE],
    /// Register file; `reg[7]` is the stack pointer
    reg: [u8; REG_COUNT],
    /// Address of the next byte to fetch
    pc: u8,
    /// Address of the opcode currently being executed, for error reports
    op_pc: u8,
    /// Flags register, written by `CMP`
    fl: u8,
}

impl Default for Cpu {
    fn default() -> Self {
        let mut reg = [0u8; REG_COUNT];
        reg[usize::from(SP)] = STACK_TOP;
        Self {
            ram: [0u8; RAM_SIZE],
            reg,
            pc: 0,
            op_pc: 0,
            fl: 0,
        }
    }
}

impl Cpu {
    /// Builds a new `Cpu` with the given program image loaded at address 0
    ///
    /// # Panics
    /// If `program` cannot fit in RAM
    pub fn new(program: &[u8]) -> Self {
        let mut out = Self::default();
        out.ram[..program.len()].copy_from_slice(program);
        out
    }

    /// Reads a byte from RAM
    #[inline]
    pub fn ram_read(&self, addr: u8) -> u8 {
        self.ram[usize::from(addr)]
    }

    /// Writes a byte to RAM
    #[inline]
    pub fn ram_write(&mut self, addr: u8, v: u8) {
        self.ram[usize::from(addr)] = v;
    }

    /// Reads a register, failing if `index` is outside the register file
    #[inline]
    pub fn reg_read(&self, index: u8) -> Result<u8, Error> {
        self.reg
            .get(usize::from(index))
            .copied()
            .ok_or(Error::OutOfBounds { pc: self.op_pc, index })
    }

    /// Writes a register, failing if `index` is outside the register file
    #[inline]
    pub fn reg_write(&mut self, index: u8, v: u8) -> Result<(), Error> {
        let pc = self.op_pc;
        *self
            .reg
            .get_mut(usize::from(index))
            .ok_or(Error::OutOfBounds { pc, index })? = v;
        Ok(())
    }

    /// Returns the current program counter
    #[inline]
    pub fn pc(&self) -> u8 {
        self.pc
    }

    /// Returns the flags register
    #[inline]
    pub fn flags(&self) -> u8 {
        self.fl
    }

    /// Shared borrow of the register file
    #[inline]
    pub fn regs(&self) -> &[u8; REG_COUNT] {
        &self.reg
    }

    /// Reads a byte from RAM at the program counter, advancing it
    ///
    /// The program counter is a `u8`, so it wraps at the top of RAM.
    #[inline]
    fn next(&mut self) -> u8 {
        let out = self.ram[usize::from(self.pc)];
        self.pc = self.pc.wrapping_add(1);
        out
    }

    /// Pushes a byte onto the hardware stack
    #[inline]
    fn push(&mut self, v: u8) {
        let sp = self.reg[usize::from(SP)].wrapping_sub(1);
        self.reg[usize::from(SP)] = sp;
        self.ram[usize::from(sp)] = v;
    }

    /// Pops a byte off the hardware stack
    #[inline]
    fn pop(&mut self) -> Result<u8, Error> {
        let sp = self.reg[usize::from(SP)];
        if sp == STACK_TOP {
            return Err(Error::StackUnderflow { pc: self.op_pc });
        }
        let v = self.ram[usize::from(sp)];
        self.reg[usize::from(SP)] = sp.wrapping_add(1);
        Ok(v)
    }

    /// Executes the instruction at the program counter
    ///
    /// Returns `Ok(true)` if the instruction was `HLT`.
    pub fn step<D: Device>(&mut self, dev: &mut D) -> Result<bool, Error> {
        self.op_pc = self.pc;
        let i = self.next();
        let Some(op) = Op::from_byte(i) else {
            return Err(Error::InvalidOpcode { pc: self.op_pc, byte: i });
        };
        self.run_op(op, dev)
    }

    /// Runs the VM until it halts or faults
    pub fn run<D: Device>(&mut self, dev: &mut D) -> Result<(), Error> {
        while !self.step(dev)? {}
        Ok(())
    }

    fn run_op<D: Device>(&mut self, op: Op, dev: &mut D) -> Result<bool, Error> {
        match op {
            Op::Hlt => return Ok(true),
            Op::Ldi => {
                let r = self.next();
                let v = self.next();
                self.reg_write(r, v)?;
            }
            Op::Push => {
                let r = self.next();
                let v = self.reg_read(r)?;
                self.push(v);
            }
            Op::Pop => {
                let r = self.next();
                let v = self.pop()?;
                self.reg_write(r, v)?;
            }
            Op::Mul => {
                let (a, b) = self.operands();
                let r = self.reg_read(a)?.wrapping_mul(self.reg_read(b)?);
                self.reg_write(a, r)?;
            }
            Op::Add => {
                let (a, b) = self.operands();
                let r = self.reg_read(a)?.wrapping_add(self.reg_read(b)?);
                self.reg_write(a, r)?;
            }
            Op::Prn => {
                let r = self.next();
                dev.print(self.reg_read(r)?);
            }
            Op::Call => {
                let r = self.next();
                let ret = self.pc;
                self.push(ret);
                self.pc = self.reg_read(r)?;
            }
            Op::Ret => {
                self.pc = self.pop()?;
            }
            Op::Cmp => {
                let (a, b) = self.operands();
                let a = self.reg_read(a)?;
                let b = self.reg_read(b)?;
                self.fl = match a.cmp(&b) {
                    core::cmp::Ordering::Equal => FLAG_EQ,
                    core::cmp::Ordering::Less => FLAG_LT,
                    core::cmp::Ordering::Greater => FLAG_GT,
                };
            }
            Op::Jmp => {
                let r = self.next();
                self.pc = self.reg_read(r)?;
            }
            Op::Jne => {
                let r = self.next();
                if self.fl & FLAG_EQ == 0 {
                    self.pc = self.reg_read(r)?;
                }
            }
            Op::Jeq => {
                let r = self.next();
                if self.fl & FLAG_EQ != 0 {
                    self.pc = self.reg_read(r)?;
                }
            }
        }
        Ok(false)
    }

    /// Fetches the two register-index operands of a three-byte instruction
    #[inline]
    fn operands(&mut self) -> (u8, u8) {
        let a = self.next();
        let b = self.next();
        (a, b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const HLT: u8 = Op::Hlt.byte();
    const LDI: u8 = Op::Ldi.byte();
    const PUSH: u8 = Op::Push.byte();
    const POP: u8 = Op::Pop.byte();
    const MUL: u8 = Op::Mul.byte();
    const ADD: u8 = Op::Add.byte();
    const PRN: u8 = Op::Prn.byte();
    const CALL: u8 = Op::Call.byte();
    const RET: u8 = Op::Ret.byte();
    const CMP: u8 = Op::Cmp.byte();
    const JMP: u8 = Op::Jmp.byte();
    const JNE: u8 = Op::Jne.byte();
    const JEQ: u8 = Op::Jeq.byte();

    /// Test device which records everything printed
    #[derive(Default)]
    struct Output(Vec<u8>);

    impl Device for Output {
        fn print(&mut self, value: u8) {
            self.0.push(value);
        }
    }

    /// Runs a program to completion, returning everything it printed
    fn run_program(program: &[u8]) -> Vec<u8> {
        let mut cpu = Cpu::new(program);
        let mut out = Output::default();
        cpu.run(&mut out).unwrap();
        out.0
    }

    #[test]
    fn add_wraps() {
        for (a, b) in [(1u8, 2u8), (200, 100), (255, 255), (0, 0), (128, 128)]
        {
            let mut cpu = Cpu::new(&[ADD, 0, 1, HLT]);
            cpu.reg_write(0, a).unwrap();
            cpu.reg_write(1, b).unwrap();
            cpu.run(&mut Output::default()).unwrap();
            assert_eq!(cpu.reg_read(0).unwrap(), a.wrapping_add(b));
        }
    }

    #[test]
    fn mul_wraps() {
        for (a, b) in [(5u8, 6u8), (16, 16), (255, 2), (100, 100), (0, 255)] {
            let mut cpu = Cpu::new(&[MUL, 0, 1, HLT]);
            cpu.reg_write(0, a).unwrap();
            cpu.reg_write(1, b).unwrap();
            cpu.run(&mut Output::default()).unwrap();
            assert_eq!(cpu.reg_read(0).unwrap(), a.wrapping_mul(b));
        }
    }

    #[test]
    fn ldi_then_prn() {
        assert_eq!(run_program(&[LDI, 0, 42, PRN, 0, HLT]), vec![42]);
    }

    #[test]
    fn push_pop_round_trip() {
        let mut cpu =
            Cpu::new(&[LDI, 0, 77, PUSH, 0, LDI, 0, 0, POP, 0, HLT]);
        cpu.run(&mut Output::default()).unwrap();
        assert_eq!(cpu.reg_read(0).unwrap(), 77);
        assert_eq!(cpu.reg_read(SP).unwrap(), STACK_TOP);
    }

    #[test]
    fn call_ret() {
        // 0: LDI r1, 8   3: CALL r1   5: PRN r0   7: HLT
        // 8: LDI r0, 123   11: RET
        let prog = [LDI, 1, 8, CALL, 1, PRN, 0, HLT, LDI, 0, 123, RET];
        let mut cpu = Cpu::new(&prog);
        let mut out = Output::default();
        cpu.step(&mut out).unwrap(); // LDI
        cpu.step(&mut out).unwrap(); // CALL
        assert_eq!(cpu.pc(), 8);
        cpu.step(&mut out).unwrap(); // LDI in the subroutine
        cpu.step(&mut out).unwrap(); // RET
        assert_eq!(cpu.pc(), 5); // call site + 2
        assert_eq!(cpu.reg_read(SP).unwrap(), STACK_TOP);
        cpu.run(&mut out).unwrap();
        assert_eq!(out.0, vec![123]);
    }

    #[test]
    fn cmp_sets_exactly_one_flag() {
        for (a, b, flag) in
            [(5, 5, FLAG_EQ), (3, 9, FLAG_LT), (9, 3, FLAG_GT)]
        {
            let mut cpu =
                Cpu::new(&[LDI, 0, a, LDI, 1, b, CMP, 0, 1, HLT]);
            cpu.run(&mut Output::default()).unwrap();
            assert_eq!(cpu.flags(), flag, "CMP {a} {b}");
            assert_eq!(cpu.flags().count_ones(), 1);
        }
    }

    /// Runs `CMP a b` then the given conditional jump (with target 99),
    /// returning the PC after the jump executes
    fn branch_pc(jump: u8, a: u8, b: u8) -> u8 {
        let prog = [LDI, 0, a, LDI, 1, b, LDI, 2, 99, CMP, 0, 1, jump, 2];
        let mut cpu = Cpu::new(&prog);
        let mut out = Output::default();
        for _ in 0..5 {
            cpu.step(&mut out).unwrap();
        }
        cpu.pc()
    }

    #[test]
    fn conditional_jumps_follow_the_equal_flag() {
        assert_eq!(branch_pc(JEQ, 7, 7), 99);
        assert_eq!(branch_pc(JEQ, 7, 8), 14);
        assert_eq!(branch_pc(JNE, 7, 8), 99);
        assert_eq!(branch_pc(JNE, 7, 7), 14);
    }

    #[test]
    fn jmp_is_unconditional() {
        // 5 holds an unassigned byte; JMP must skip over it
        let prog = [LDI, 0, 6, JMP, 0, 0xFF, HLT];
        let mut cpu = Cpu::new(&prog);
        cpu.run(&mut Output::default()).unwrap();
        assert_eq!(cpu.pc(), 7);
    }

    #[test]
    fn multiply_and_print() {
        let prog = [LDI, 0, 5, LDI, 1, 6, MUL, 0, 1, PRN, 0, HLT];
        assert_eq!(run_program(&prog), vec![30]);
    }

    #[test]
    fn stack_pops_in_reverse_order() {
        let prog = [
            LDI, 0, 1, LDI, 1, 2, LDI, 2, 3, //
            PUSH, 0, PUSH, 1, PUSH, 2, //
            POP, 3, PRN, 3, POP, 3, PRN, 3, POP, 3, PRN, 3, HLT,
        ];
        assert_eq!(run_program(&prog), vec![3, 2, 1]);
    }

    #[test]
    fn invalid_opcode_faults() {
        let mut cpu = Cpu::new(&[0xFF]);
        assert_eq!(
            cpu.step(&mut Output::default()),
            Err(Error::InvalidOpcode { pc: 0, byte: 0xFF })
        );
    }

    #[test]
    fn bad_register_index_faults() {
        let mut cpu = Cpu::new(&[LDI, 8, 1]);
        assert_eq!(
            cpu.step(&mut Output::default()),
            Err(Error::OutOfBounds { pc: 0, index: 8 })
        );
    }

    #[test]
    fn empty_stack_faults() {
        let mut cpu = Cpu::new(&[POP, 0]);
        assert_eq!(
            cpu.step(&mut Output::default()),
            Err(Error::StackUnderflow { pc: 0 })
        );

        let mut cpu = Cpu::new(&[RET]);
        assert_eq!(
            cpu.step(&mut Output::default()),
            Err(Error::StackUnderflow { pc: 0 })
        );
    }
}
