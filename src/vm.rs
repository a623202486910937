// (C) 2020 Brandon Lewis
//
// The sandboxed machine that applies a program to its inputs.
//
// Programs are pure functions from Names to Names. The machine is the
// only place a program runs, and the five host calls are the only way
// a program can reach the world outside its own scratch memory. There
// is no filesystem, no network, no clock, and no randomness in here,
// which is what makes memoizing an application sound.
//
// *Execution Model*
//
// A program consists of a sequence of typed instructions and an
// immutable data section of constants. Execution begins at the first
// instruction with the encode Tree's handle as the sole argument of
// the root frame, and ends at Halt or by running off the end of the
// instruction sequence.
//
// *Memory*
//
// The machine owns two classes of memory regions. Read-only slots are
// backed by Blobs attached through the host interface. Read-write
// slots are zeroed scratch buffers whose sizes the module header
// declares. A handle table carries Names across the boundary; index 0
// is always the encode Tree. Programs touch memory only through
// bounds-checked load and store instructions.
//
// *Host Interface*
//
// Host-call operands travel on the value stack, pushed in the order
// the call names them and popped in reverse:
//
//   AttachBlob       handle, slot   -> map the Blob into the ro slot
//   DetachMem        slot           -> unmap an ro slot
//   GetTreeEntry     handle, index  -> push the i-th entry's handle
//   FreezeBlob       slot, size     -> content-address the first
//                                      `size` bytes of the rw slot,
//                                      push the new Blob's handle
//   DesignateOutput  handle         -> record an output
//
// *Safety*
//
// The instruction set is strongly typed and every failure is a Trap,
// listed exhaustively below. Misuse of a host call (an out-of-range
// slot, an unknown Name, a freeze larger than its slot) traps the
// program, never the host. A trap is fatal for the enclosing
// application and surfaces to the evaluator; no result is cached for
// a trapped application.
//
// *Values*
//
// Stack cells are Bool, Int, Addr, or Ref. Arithmetic is on Int only,
// wrapping on overflow; division by zero traps. Addr cells may only
// steer branches and calls. Ref cells index the handle table and are
// created only by the host.

use std::fmt;

use enumflags2::BitFlags;

use crate::config::Limits;
use crate::name::{Kind, KindSet, Name};
use crate::program::Module;
use crate::store::{Object, Store};


// The in-memory opcode format. Illegal operations are unrepresentable
// rather than checked.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Opcode {
    // Push a constant from the data section.
    LoadI(u16),
    Binary(BinOp),
    Unary(UnOp),
    BranchTrue,
    BranchFalse,
    Branch,
    Call(u8),
    Ret(u8),
    Arg(u8),
    Drop(u8),
    Dup(u8),
    // Read a byte / little-endian u32 from an ro slot, offset popped.
    LoadB(u8),
    LoadW(u8),
    // Write a byte / little-endian u32 to an rw slot; pops the offset,
    // then the value.
    StoreB(u8),
    StoreW(u8),
    // Push the length of the blob attached to an ro slot.
    BlobLen(u8),
    Host(HostCall),
    Halt,
}


#[derive(Copy, Clone, Debug, PartialEq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Lt,
    Gt,
    Lte,
    Gte,
    Eq,
}


#[derive(Copy, Clone, Debug, PartialEq)]
pub enum UnOp {
    Not,
    Neg,
    Abs,
}


#[derive(Copy, Clone, Debug, PartialEq)]
pub enum HostCall {
    AttachBlob,
    DetachMem,
    GetTreeEntry,
    FreezeBlob,
    DesignateOutput,
}


// All valid stack cells.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Addr(usize),
    Ref(usize),
}


#[derive(BitFlags, Copy, Clone, Debug, PartialEq)]
#[repr(u8)]
pub enum CellTag {
    Bool = 0b0001,
    Int  = 0b0010,
    Addr = 0b0100,
    Ref  = 0b1000,
}


pub type CellSet = BitFlags<CellTag>;


impl Value {
    pub fn tag(&self) -> CellTag {
        match self {
            Value::Bool(_) => CellTag::Bool,
            Value::Int(_) => CellTag::Int,
            Value::Addr(_) => CellTag::Addr,
            Value::Ref(_) => CellTag::Ref,
        }
    }
}


// The result of any machine operation.
pub type Result<T> = core::result::Result<T, Trap>;


// Every way a program can die. All are non-recoverable for the
// enclosing application.
#[derive(Clone, Debug, PartialEq)]
pub enum Trap {
    Underflow,
    Overflow,
    IllegalAddr(usize),
    TypeError { expect: CellSet, got: CellTag },
    TypeMismatch(CellTag, CellTag),
    // A host call was handed a Name of the wrong kind.
    KindError { expect: KindSet, got: Kind },
    BadSlot(usize),
    SlotBusy(usize),
    SlotEmpty(usize),
    OutOfRange { slot: usize, offset: i64 },
    FreezeSize { size: i64, limit: usize },
    IndexError(i64),
    BadHandle(usize),
    UnknownName(Name),
    Arity(u8, u8),
    CallDepth,
    TableFull,
    OutOfFuel,
    NoOutput,
    DivideByZero,
    BadModule(String),
    Halt,
}


impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Trap::Underflow => write!(f, "stack underflow"),
            Trap::Overflow => write!(f, "stack overflow"),
            Trap::IllegalAddr(addr) => write!(f, "illegal address {}", addr),
            Trap::TypeError { expect, got } => {
                write!(f, "expected one of {:?}, got {:?}", expect, got)
            }
            Trap::TypeMismatch(a, b) => write!(f, "operands {:?} and {:?} do not mix", a, b),
            Trap::KindError { expect, got } => {
                write!(f, "expected a name of kind {:?}, got {:?}", expect, got)
            }
            Trap::BadSlot(slot) => write!(f, "no such memory slot {}", slot),
            Trap::SlotBusy(slot) => write!(f, "memory slot {} is already attached", slot),
            Trap::SlotEmpty(slot) => write!(f, "memory slot {} has nothing attached", slot),
            Trap::OutOfRange { slot, offset } => {
                write!(f, "offset {} is outside memory slot {}", offset, slot)
            }
            Trap::FreezeSize { size, limit } => {
                write!(f, "freeze of {} bytes exceeds the {} byte slot", size, limit)
            }
            Trap::IndexError(index) => write!(f, "tree index {} out of range", index),
            Trap::BadHandle(handle) => write!(f, "no such handle {}", handle),
            Trap::UnknownName(name) => write!(f, "unknown name {:?}", name),
            Trap::Arity(expect, got) => write!(f, "expected {} values, found {}", expect, got),
            Trap::CallDepth => write!(f, "call stack exhausted"),
            Trap::TableFull => write!(f, "handle table exhausted"),
            Trap::OutOfFuel => write!(f, "instruction budget exhausted"),
            Trap::NoOutput => write!(f, "program designated no output"),
            Trap::DivideByZero => write!(f, "division by zero"),
            Trap::BadModule(reason) => write!(f, "malformed module: {}", reason),
            Trap::Halt => write!(f, "halt"),
        }
    }
}


fn expected(expect: CellSet, got: &Value) -> Trap {
    Trap::TypeError { expect, got: got.tag() }
}


// Apply a binary operator. Arithmetic and comparison are Int only;
// the logical operators also take Bool pairs; Eq takes any pair and
// mismatched tags compare unequal.
fn binary(op: BinOp, a: Value, b: Value) -> Result<Value> {
    use Value::*;
    match (op, a, b) {
        (BinOp::Add, Int(a), Int(b)) => Ok(Int(a.wrapping_add(b))),
        (BinOp::Sub, Int(a), Int(b)) => Ok(Int(a.wrapping_sub(b))),
        (BinOp::Mul, Int(a), Int(b)) => Ok(Int(a.wrapping_mul(b))),
        (BinOp::Div, Int(_), Int(0)) => Err(Trap::DivideByZero),
        (BinOp::Div, Int(a), Int(b)) => Ok(Int(a.wrapping_div(b))),
        (BinOp::Mod, Int(_), Int(0)) => Err(Trap::DivideByZero),
        (BinOp::Mod, Int(a), Int(b)) => Ok(Int(a.wrapping_rem(b))),
        (BinOp::And, Int(a), Int(b)) => Ok(Int(a & b)),
        (BinOp::And, Bool(a), Bool(b)) => Ok(Bool(a & b)),
        (BinOp::Or, Int(a), Int(b)) => Ok(Int(a | b)),
        (BinOp::Or, Bool(a), Bool(b)) => Ok(Bool(a | b)),
        (BinOp::Xor, Int(a), Int(b)) => Ok(Int(a ^ b)),
        (BinOp::Xor, Bool(a), Bool(b)) => Ok(Bool(a ^ b)),
        (BinOp::Shl, Int(a), Int(b)) => Ok(Int(a.wrapping_shl(b as u32))),
        (BinOp::Shr, Int(a), Int(b)) => Ok(Int(a.wrapping_shr(b as u32))),
        (BinOp::Lt, Int(a), Int(b)) => Ok(Bool(a < b)),
        (BinOp::Gt, Int(a), Int(b)) => Ok(Bool(a > b)),
        (BinOp::Lte, Int(a), Int(b)) => Ok(Bool(a <= b)),
        (BinOp::Gte, Int(a), Int(b)) => Ok(Bool(a >= b)),
        (BinOp::Eq, a, b) => Ok(Bool(a == b)),
        (_, a, b) => Err(Trap::TypeMismatch(a.tag(), b.tag())),
    }
}


fn unary(op: UnOp, value: Value) -> Result<Value> {
    use Value::*;
    match (op, value) {
        (UnOp::Not, Bool(a)) => Ok(Bool(!a)),
        (UnOp::Not, Int(a)) => Ok(Int(!a)),
        (UnOp::Neg, Int(a)) => Ok(Int(a.wrapping_neg())),
        (UnOp::Abs, Int(a)) => Ok(Int(a.wrapping_abs())),
        (UnOp::Not, ref v) => Err(expected(CellTag::Bool | CellTag::Int, v)),
        (_, ref v) => Err(expected(BitFlags::from_flag(CellTag::Int), v)),
    }
}


#[derive(Copy, Clone)]
struct StackFrame {
    return_address: usize,
    frame_pointer: usize,
    arity: u8,
}


// The type of control flow an instruction can have.
enum ControlFlow {
    Advance,
    Branch(usize),
    Yield(Value),
}


// One application in flight. The machine borrows the store for host
// calls and owns everything else.
pub struct Machine<'a> {
    store: &'a Store,
    module: &'a Module,
    limits: &'a Limits,
    stack: Vec<Value>,
    call_stack: Vec<StackFrame>,
    cur_frame: StackFrame,
    pc: usize,
    fuel: u64,
    ro: Vec<Option<std::sync::Arc<Vec<u8>>>>,
    rw: Vec<Vec<u8>>,
    handles: Vec<Name>,
    outputs: Vec<Name>,
}


impl<'a> Machine<'a> {
    pub fn new(store: &'a Store, module: &'a Module, encode: Name, limits: &'a Limits) -> Machine<'a> {
        Machine {
            store,
            module,
            limits,
            // The encode handle is the apply entry's sole argument.
            stack: vec![Value::Ref(0)],
            call_stack: Vec::new(),
            cur_frame: StackFrame {
                return_address: 0,
                frame_pointer: 0,
                arity: 1,
            },
            pc: 0,
            fuel: limits.fuel,
            ro: vec![None; module.ro_slots as usize],
            rw: module.rw_slots.iter().map(|size| vec![0u8; *size as usize]).collect(),
            handles: vec![encode],
            outputs: Vec::new(),
        }
    }

    // Safely fetch the opcode at the given address. Running off the
    // end of the instruction sequence halts.
    fn fetch(&self, index: usize) -> Result<Opcode> {
        let len = self.module.code.len();
        if index < len {
            Ok(self.module.code[index])
        } else if index == len {
            Err(Trap::Halt)
        } else {
            Err(Trap::IllegalAddr(index))
        }
    }

    fn push(&mut self, value: Value) -> Result<ControlFlow> {
        if self.stack.len() >= self.limits.stack_depth {
            return Err(Trap::Overflow);
        }
        self.stack.push(value);
        Ok(ControlFlow::Advance)
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(Trap::Underflow)
    }

    fn pop_int(&mut self) -> Result<i64> {
        match self.pop()? {
            Value::Int(value) => Ok(value),
            v => Err(expected(BitFlags::from_flag(CellTag::Int), &v)),
        }
    }

    fn pop_bool(&mut self) -> Result<bool> {
        match self.pop()? {
            Value::Bool(value) => Ok(value),
            v => Err(expected(BitFlags::from_flag(CellTag::Bool), &v)),
        }
    }

    fn pop_addr(&mut self) -> Result<usize> {
        match self.pop()? {
            Value::Addr(value) => Ok(value),
            v => Err(expected(BitFlags::from_flag(CellTag::Addr), &v)),
        }
    }

    // Pop a handle-table index and resolve it to a Name.
    fn pop_handle(&mut self) -> Result<Name> {
        match self.pop()? {
            Value::Ref(index) => {
                self.handles.get(index).copied().ok_or(Trap::BadHandle(index))
            }
            v => Err(expected(BitFlags::from_flag(CellTag::Ref), &v)),
        }
    }

    // Append a Name to the handle table and push its Ref.
    fn push_handle(&mut self, name: Name) -> Result<ControlFlow> {
        if self.handles.len() >= self.limits.handle_slots {
            return Err(Trap::TableFull);
        }
        self.handles.push(name);
        self.push(Value::Ref(self.handles.len() - 1))
    }

    fn load_immediate(&mut self, index: usize) -> Result<ControlFlow> {
        if index < self.module.data.len() {
            self.push(self.module.data[index])
        } else {
            Err(Trap::IllegalAddr(index))
        }
    }

    fn binop(&mut self, op: BinOp) -> Result<ControlFlow> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok(ControlFlow::Yield(binary(op, a, b)?))
    }

    fn unop(&mut self, op: UnOp) -> Result<ControlFlow> {
        let value = self.pop()?;
        Ok(ControlFlow::Yield(unary(op, value)?))
    }

    // Push a frame onto the call stack, and branch.
    fn call(&mut self, arity: u8) -> Result<ControlFlow> {
        let target = self.pop_addr()?;
        if self.call_stack.len() >= self.limits.call_depth {
            return Err(Trap::CallDepth);
        }
        if self.stack.len() < arity as usize {
            return Err(Trap::Underflow);
        }
        self.call_stack.push(self.cur_frame);
        self.cur_frame = StackFrame {
            return_address: self.pc + 1,
            frame_pointer: self.stack.len() - arity as usize,
            arity,
        };
        Ok(ControlFlow::Branch(target))
    }

    // Return from subroutine, dropping the arguments out from under
    // the return values.
    fn ret(&mut self, retvals: u8) -> Result<ControlFlow> {
        let fp = self.cur_frame.frame_pointer;
        let target = self.cur_frame.return_address;
        for _ in 0..self.cur_frame.arity {
            if fp >= self.stack.len() {
                return Err(Trap::Underflow);
            }
            self.stack.remove(fp);
        }
        if self.stack.len() != fp + retvals as usize {
            let got = self.stack.len().saturating_sub(fp).min(u8::max_value() as usize);
            return Err(Trap::Arity(retvals, got as u8));
        }
        self.cur_frame = self.call_stack.pop().ok_or(Trap::Underflow)?;
        Ok(ControlFlow::Branch(target))
    }

    // Fetch an argument relative to the current stack frame.
    fn arg(&mut self, n: u8) -> Result<ControlFlow> {
        if n >= self.cur_frame.arity {
            return Err(Trap::Arity(n, self.cur_frame.arity));
        }
        let index = self.cur_frame.frame_pointer + n as usize;
        if index >= self.stack.len() {
            return Err(Trap::Underflow);
        }
        Ok(ControlFlow::Yield(self.stack[index]))
    }

    fn branch_true(&mut self) -> Result<ControlFlow> {
        let target = self.pop_addr()?;
        let cond = self.pop_bool()?;
        Ok(if cond {
            ControlFlow::Branch(target)
        } else {
            ControlFlow::Advance
        })
    }

    fn branch_false(&mut self) -> Result<ControlFlow> {
        let target = self.pop_addr()?;
        let cond = self.pop_bool()?;
        Ok(if cond {
            ControlFlow::Advance
        } else {
            ControlFlow::Branch(target)
        })
    }

    fn branch(&mut self) -> Result<ControlFlow> {
        let target = self.pop_addr()?;
        Ok(ControlFlow::Branch(target))
    }

    fn drop_cells(&mut self, n: u8) -> Result<ControlFlow> {
        for _ in 0..n {
            self.pop()?;
        }
        Ok(ControlFlow::Advance)
    }

    fn dup(&mut self, n: u8) -> Result<ControlFlow> {
        let top = self.pop()?;
        for _ in 0..(n as usize + 1) {
            self.push(top)?;
        }
        Ok(ControlFlow::Advance)
    }

    // Read-only slot contents, which must be attached.
    fn ro_bytes(&self, slot: usize) -> Result<&[u8]> {
        match self.ro.get(slot) {
            None => Err(Trap::BadSlot(slot)),
            Some(None) => Err(Trap::SlotEmpty(slot)),
            Some(Some(bytes)) => Ok(bytes.as_slice()),
        }
    }

    fn ro_range(&self, slot: usize, offset: i64, width: usize) -> Result<usize> {
        let bytes = self.ro_bytes(slot)?;
        let start = offset as usize;
        if offset < 0 || start + width > bytes.len() {
            return Err(Trap::OutOfRange { slot, offset });
        }
        Ok(start)
    }

    fn load_byte(&mut self, slot: usize) -> Result<ControlFlow> {
        let offset = self.pop_int()?;
        let start = self.ro_range(slot, offset, 1)?;
        let byte = self.ro_bytes(slot)?[start];
        self.push(Value::Int(byte as i64))
    }

    fn load_word(&mut self, slot: usize) -> Result<ControlFlow> {
        let offset = self.pop_int()?;
        let start = self.ro_range(slot, offset, 4)?;
        let bytes = self.ro_bytes(slot)?;
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[start..start + 4]);
        self.push(Value::Int(u32::from_le_bytes(word) as i64))
    }

    fn rw_range(&self, slot: usize, offset: i64, width: usize) -> Result<usize> {
        let len = self.rw.get(slot).ok_or(Trap::BadSlot(slot))?.len();
        let start = offset as usize;
        if offset < 0 || start + width > len {
            return Err(Trap::OutOfRange { slot, offset });
        }
        Ok(start)
    }

    fn store_byte(&mut self, slot: usize) -> Result<ControlFlow> {
        let offset = self.pop_int()?;
        let value = self.pop_int()?;
        let start = self.rw_range(slot, offset, 1)?;
        self.rw[slot][start] = value as u8;
        Ok(ControlFlow::Advance)
    }

    fn store_word(&mut self, slot: usize) -> Result<ControlFlow> {
        let offset = self.pop_int()?;
        let value = self.pop_int()?;
        let start = self.rw_range(slot, offset, 4)?;
        self.rw[slot][start..start + 4].copy_from_slice(&(value as u32).to_le_bytes());
        Ok(ControlFlow::Advance)
    }

    fn blob_len(&mut self, slot: usize) -> Result<ControlFlow> {
        let len = self.ro_bytes(slot)?.len();
        self.push(Value::Int(len as i64))
    }

    // Map a Blob's bytes into a read-only slot.
    fn attach_blob(&mut self) -> Result<ControlFlow> {
        let slot = self.pop_int()? as usize;
        let name = self.pop_handle()?;
        match name.kind() {
            Kind::Blob | Kind::Literal => {}
            got => {
                return Err(Trap::KindError {
                    expect: Kind::Blob | Kind::Literal,
                    got,
                })
            }
        }
        let bytes = self.store.blob(name).map_err(|_| Trap::UnknownName(name))?;
        match self.ro.get_mut(slot) {
            None => Err(Trap::BadSlot(slot)),
            Some(Some(_)) => Err(Trap::SlotBusy(slot)),
            Some(target) => {
                *target = Some(bytes);
                Ok(ControlFlow::Advance)
            }
        }
    }

    fn detach_mem(&mut self) -> Result<ControlFlow> {
        let slot = self.pop_int()? as usize;
        match self.ro.get_mut(slot) {
            None => Err(Trap::BadSlot(slot)),
            Some(None) => Err(Trap::SlotEmpty(slot)),
            Some(target) => {
                *target = None;
                Ok(ControlFlow::Advance)
            }
        }
    }

    // Resolve the i-th Name of a Tree into a fresh handle.
    fn get_tree_entry(&mut self) -> Result<ControlFlow> {
        let index = self.pop_int()?;
        let name = self.pop_handle()?;
        if name.kind() != Kind::Tree {
            return Err(Trap::KindError {
                expect: BitFlags::from_flag(Kind::Tree),
                got: name.kind(),
            });
        }
        let entries = self.store.tree(name).map_err(|_| Trap::UnknownName(name))?;
        if index < 0 || index as usize >= entries.len() {
            return Err(Trap::IndexError(index));
        }
        self.push_handle(entries[index as usize])
    }

    // Content-address the first `size` bytes of an rw slot.
    fn freeze_blob(&mut self) -> Result<ControlFlow> {
        let size = self.pop_int()?;
        let slot = self.pop_int()? as usize;
        let limit = self.rw.get(slot).ok_or(Trap::BadSlot(slot))?.len();
        if size < 0 || size as usize > limit {
            return Err(Trap::FreezeSize { size, limit });
        }
        let bytes = self.rw[slot][..size as usize].to_vec();
        let name = self
            .store
            .put(Object::Blob(bytes))
            .expect("blob insertion is infallible");
        self.push_handle(name)
    }

    fn designate_output(&mut self) -> Result<ControlFlow> {
        let name = self.pop_handle()?;
        self.outputs.push(name);
        Ok(ControlFlow::Advance)
    }

    fn host(&mut self, call: HostCall) -> Result<ControlFlow> {
        match call {
            HostCall::AttachBlob => self.attach_blob(),
            HostCall::DetachMem => self.detach_mem(),
            HostCall::GetTreeEntry => self.get_tree_entry(),
            HostCall::FreezeBlob => self.freeze_blob(),
            HostCall::DesignateOutput => self.designate_output(),
        }
    }

    fn dispatch(&mut self, op: Opcode) -> Result<ControlFlow> {
        match op {
            Opcode::LoadI(index) => self.load_immediate(index as usize),
            Opcode::Binary(op) => self.binop(op),
            Opcode::Unary(op) => self.unop(op),
            Opcode::BranchTrue => self.branch_true(),
            Opcode::BranchFalse => self.branch_false(),
            Opcode::Branch => self.branch(),
            Opcode::Call(arity) => self.call(arity),
            Opcode::Ret(n) => self.ret(n),
            Opcode::Arg(n) => self.arg(n),
            Opcode::Drop(n) => self.drop_cells(n),
            Opcode::Dup(n) => self.dup(n),
            Opcode::LoadB(slot) => self.load_byte(slot as usize),
            Opcode::LoadW(slot) => self.load_word(slot as usize),
            Opcode::StoreB(slot) => self.store_byte(slot as usize),
            Opcode::StoreW(slot) => self.store_word(slot as usize),
            Opcode::BlobLen(slot) => self.blob_len(slot as usize),
            Opcode::Host(call) => self.host(call),
            Opcode::Halt => Err(Trap::Halt),
        }
    }

    // Single-step the program.
    fn step(&mut self) -> Result<()> {
        if self.fuel == 0 {
            return Err(Trap::OutOfFuel);
        }
        self.fuel -= 1;

        let opcode = self.fetch(self.pc)?;
        match self.dispatch(opcode)? {
            ControlFlow::Advance => self.pc += 1,
            ControlFlow::Branch(addr) => self.pc = addr,
            ControlFlow::Yield(value) => {
                self.push(value)?;
                self.pc += 1;
            }
        }
        Ok(())
    }

    // Run the program until it halts or traps.
    pub fn exec(&mut self) -> Result<()> {
        loop {
            match self.step() {
                Err(Trap::Halt) => return Ok(()),
                Err(trap) => return Err(trap),
                Ok(()) => continue,
            }
        }
    }

    // Materialize the application's result: the sole designated
    // output, or a Tree of them when the program designated several.
    pub fn finish(self) -> Result<Name> {
        match self.outputs.len() {
            0 => Err(Trap::NoOutput),
            1 => Ok(self.outputs[0]),
            _ => {
                let name = self
                    .store
                    .put(Object::Tree(self.outputs))
                    .expect("designated outputs are resolvable");
                Ok(name)
            }
        }
    }
}


// Apply a program module to its encode Tree, producing the output
// Name. The machine and its memory live exactly as long as the call.
pub fn apply(store: &Store, module: &Module, encode: Name, limits: &Limits) -> Result<Name> {
    trace!("vm: applying {} over {:?}", module.name, encode);
    let scratch: u64 = module.rw_slots.iter().map(|size| *size as u64).sum();
    if scratch > limits.rw_bytes as u64 {
        return Err(Trap::BadModule("scratch memory exceeds the runtime limit".to_string()));
    }
    let mut machine = Machine::new(store, module, encode, limits);
    machine.exec()?;
    machine.finish()
}
