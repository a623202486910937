// Program modules and their wire format.
//
// A Module is the unit a program ships in: a header naming it and
// declaring its slot shape, a data section of constants, and the
// instruction sequence. Modules are persisted as Blobs in the store,
// so the byte format below is canonical; the same module always
// freezes to the same Name.
//
// Wire layout, all integers little-endian:
//
//   magic "rdct", version byte
//   name length (u16), name bytes
//   input count, output count, ro slot count (u8 each)
//   rw slot count (u8), rw slot sizes (u32 each)
//   data count (u16), tagged constants
//   code count (u32), opcodes
//
// Decoding validates every tag and operand, so a machine never sees
// an instruction it cannot execute. A malformed module is a trap for
// whichever application tried to use it.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::vm::{BinOp, HostCall, Opcode, Trap, UnOp, Value};


const MAGIC: &[u8; 4] = b"rdct";
const VERSION: u8 = 1;

const CONST_INT: u8 = 0;
const CONST_BOOL: u8 = 1;
const CONST_ADDR: u8 = 2;


#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub name: String,
    pub inputs: u8,
    pub outputs: u8,
    pub ro_slots: u8,
    pub rw_slots: Vec<u32>,
    pub data: Vec<Value>,
    pub code: Vec<Opcode>,
}


fn binop_tag(op: BinOp) -> u8 {
    match op {
        BinOp::Add => 0,
        BinOp::Sub => 1,
        BinOp::Mul => 2,
        BinOp::Div => 3,
        BinOp::Mod => 4,
        BinOp::And => 5,
        BinOp::Or => 6,
        BinOp::Xor => 7,
        BinOp::Shl => 8,
        BinOp::Shr => 9,
        BinOp::Lt => 10,
        BinOp::Gt => 11,
        BinOp::Lte => 12,
        BinOp::Gte => 13,
        BinOp::Eq => 14,
    }
}


fn binop_from(tag: u8) -> Option<BinOp> {
    match tag {
        0 => Some(BinOp::Add),
        1 => Some(BinOp::Sub),
        2 => Some(BinOp::Mul),
        3 => Some(BinOp::Div),
        4 => Some(BinOp::Mod),
        5 => Some(BinOp::And),
        6 => Some(BinOp::Or),
        7 => Some(BinOp::Xor),
        8 => Some(BinOp::Shl),
        9 => Some(BinOp::Shr),
        10 => Some(BinOp::Lt),
        11 => Some(BinOp::Gt),
        12 => Some(BinOp::Lte),
        13 => Some(BinOp::Gte),
        14 => Some(BinOp::Eq),
        _ => None,
    }
}


fn unop_tag(op: UnOp) -> u8 {
    match op {
        UnOp::Not => 0,
        UnOp::Neg => 1,
        UnOp::Abs => 2,
    }
}


fn unop_from(tag: u8) -> Option<UnOp> {
    match tag {
        0 => Some(UnOp::Not),
        1 => Some(UnOp::Neg),
        2 => Some(UnOp::Abs),
        _ => None,
    }
}


fn host_tag(call: HostCall) -> u8 {
    match call {
        HostCall::AttachBlob => 0,
        HostCall::DetachMem => 1,
        HostCall::GetTreeEntry => 2,
        HostCall::FreezeBlob => 3,
        HostCall::DesignateOutput => 4,
    }
}


fn host_from(tag: u8) -> Option<HostCall> {
    match tag {
        0 => Some(HostCall::AttachBlob),
        1 => Some(HostCall::DetachMem),
        2 => Some(HostCall::GetTreeEntry),
        3 => Some(HostCall::FreezeBlob),
        4 => Some(HostCall::DesignateOutput),
        _ => None,
    }
}


fn bad(reason: &str) -> Trap {
    Trap::BadModule(reason.to_string())
}


fn truncated(_: std::io::Error) -> Trap {
    bad("truncated module")
}


impl Module {
    pub fn encode(&self) -> Result<Vec<u8>, Trap> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.push(VERSION);

        if self.name.len() > u16::max_value() as usize {
            return Err(bad("module name too long"));
        }
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());

        out.push(self.inputs);
        out.push(self.outputs);
        out.push(self.ro_slots);

        if self.rw_slots.len() > u8::max_value() as usize {
            return Err(bad("too many rw slots"));
        }
        out.push(self.rw_slots.len() as u8);
        for size in &self.rw_slots {
            out.extend_from_slice(&size.to_le_bytes());
        }

        if self.data.len() > u16::max_value() as usize {
            return Err(bad("data section too large"));
        }
        out.extend_from_slice(&(self.data.len() as u16).to_le_bytes());
        for constant in &self.data {
            match constant {
                Value::Int(value) => {
                    out.push(CONST_INT);
                    out.extend_from_slice(&value.to_le_bytes());
                }
                Value::Bool(value) => {
                    out.push(CONST_BOOL);
                    out.push(*value as u8);
                }
                Value::Addr(value) => {
                    out.push(CONST_ADDR);
                    out.extend_from_slice(&(*value as u32).to_le_bytes());
                }
                // Handles only exist at runtime.
                Value::Ref(_) => return Err(bad("handle constant in data section")),
            }
        }

        out.extend_from_slice(&(self.code.len() as u32).to_le_bytes());
        for op in &self.code {
            match *op {
                Opcode::LoadI(index) => {
                    out.push(0x01);
                    out.extend_from_slice(&index.to_le_bytes());
                }
                Opcode::Binary(op) => {
                    out.push(0x02);
                    out.push(binop_tag(op));
                }
                Opcode::Unary(op) => {
                    out.push(0x03);
                    out.push(unop_tag(op));
                }
                Opcode::Branch => out.push(0x04),
                Opcode::BranchTrue => out.push(0x05),
                Opcode::BranchFalse => out.push(0x06),
                Opcode::Call(arity) => {
                    out.push(0x07);
                    out.push(arity);
                }
                Opcode::Ret(n) => {
                    out.push(0x08);
                    out.push(n);
                }
                Opcode::Arg(n) => {
                    out.push(0x09);
                    out.push(n);
                }
                Opcode::Drop(n) => {
                    out.push(0x0a);
                    out.push(n);
                }
                Opcode::Dup(n) => {
                    out.push(0x0b);
                    out.push(n);
                }
                Opcode::LoadB(slot) => {
                    out.push(0x0c);
                    out.push(slot);
                }
                Opcode::LoadW(slot) => {
                    out.push(0x0d);
                    out.push(slot);
                }
                Opcode::StoreB(slot) => {
                    out.push(0x0e);
                    out.push(slot);
                }
                Opcode::StoreW(slot) => {
                    out.push(0x0f);
                    out.push(slot);
                }
                Opcode::BlobLen(slot) => {
                    out.push(0x10);
                    out.push(slot);
                }
                Opcode::Host(call) => {
                    out.push(0x11);
                    out.push(host_tag(call));
                }
                Opcode::Halt => out.push(0x12),
            }
        }
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Module, Trap> {
        let mut cur = Cursor::new(bytes);

        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic).map_err(truncated)?;
        if &magic != MAGIC {
            return Err(bad("bad magic"));
        }
        if cur.read_u8().map_err(truncated)? != VERSION {
            return Err(bad("unsupported version"));
        }

        let name_len = cur.read_u16::<LittleEndian>().map_err(truncated)? as usize;
        let mut name = vec![0u8; name_len];
        cur.read_exact(&mut name).map_err(truncated)?;
        let name = String::from_utf8(name).map_err(|_| bad("module name is not utf-8"))?;

        let inputs = cur.read_u8().map_err(truncated)?;
        let outputs = cur.read_u8().map_err(truncated)?;
        let ro_slots = cur.read_u8().map_err(truncated)?;

        let rw_count = cur.read_u8().map_err(truncated)? as usize;
        let mut rw_slots = Vec::with_capacity(rw_count);
        for _ in 0..rw_count {
            rw_slots.push(cur.read_u32::<LittleEndian>().map_err(truncated)?);
        }

        let data_count = cur.read_u16::<LittleEndian>().map_err(truncated)? as usize;
        let mut data = Vec::with_capacity(data_count);
        for _ in 0..data_count {
            let constant = match cur.read_u8().map_err(truncated)? {
                CONST_INT => Value::Int(cur.read_i64::<LittleEndian>().map_err(truncated)?),
                CONST_BOOL => Value::Bool(cur.read_u8().map_err(truncated)? != 0),
                CONST_ADDR => {
                    Value::Addr(cur.read_u32::<LittleEndian>().map_err(truncated)? as usize)
                }
                _ => return Err(bad("unknown constant tag")),
            };
            data.push(constant);
        }

        let code_count = cur.read_u32::<LittleEndian>().map_err(truncated)? as usize;
        // The count is untrusted; let the vector grow instead of
        // pre-sizing to whatever the header claims.
        let mut code = Vec::with_capacity(code_count.min(1 << 16));
        for _ in 0..code_count {
            let op = match cur.read_u8().map_err(truncated)? {
                0x01 => Opcode::LoadI(cur.read_u16::<LittleEndian>().map_err(truncated)?),
                0x02 => Opcode::Binary(
                    binop_from(cur.read_u8().map_err(truncated)?)
                        .ok_or_else(|| bad("unknown binary operator"))?,
                ),
                0x03 => Opcode::Unary(
                    unop_from(cur.read_u8().map_err(truncated)?)
                        .ok_or_else(|| bad("unknown unary operator"))?,
                ),
                0x04 => Opcode::Branch,
                0x05 => Opcode::BranchTrue,
                0x06 => Opcode::BranchFalse,
                0x07 => Opcode::Call(cur.read_u8().map_err(truncated)?),
                0x08 => Opcode::Ret(cur.read_u8().map_err(truncated)?),
                0x09 => Opcode::Arg(cur.read_u8().map_err(truncated)?),
                0x0a => Opcode::Drop(cur.read_u8().map_err(truncated)?),
                0x0b => Opcode::Dup(cur.read_u8().map_err(truncated)?),
                0x0c => Opcode::LoadB(cur.read_u8().map_err(truncated)?),
                0x0d => Opcode::LoadW(cur.read_u8().map_err(truncated)?),
                0x0e => Opcode::StoreB(cur.read_u8().map_err(truncated)?),
                0x0f => Opcode::StoreW(cur.read_u8().map_err(truncated)?),
                0x10 => Opcode::BlobLen(cur.read_u8().map_err(truncated)?),
                0x11 => Opcode::Host(
                    host_from(cur.read_u8().map_err(truncated)?)
                        .ok_or_else(|| bad("unknown host call"))?,
                ),
                0x12 => Opcode::Halt,
                _ => return Err(bad("unknown opcode")),
            };
            code.push(op);
        }

        if cur.position() as usize != bytes.len() {
            return Err(bad("trailing bytes"));
        }

        let module = Module {
            name,
            inputs,
            outputs,
            ro_slots,
            rw_slots,
            data,
            code,
        };
        module.check()?;
        Ok(module)
    }

    // Static validation: every operand a decoded instruction carries
    // must land inside the module.
    fn check(&self) -> Result<(), Trap> {
        for constant in &self.data {
            if let Value::Addr(target) = constant {
                // Addressing one past the end halts, like running off
                // the end of the code.
                if *target > self.code.len() {
                    return Err(bad("address constant out of range"));
                }
            }
        }
        for op in &self.code {
            match *op {
                Opcode::LoadI(index) => {
                    if index as usize >= self.data.len() {
                        return Err(bad("constant index out of range"));
                    }
                }
                Opcode::LoadB(slot) | Opcode::LoadW(slot) | Opcode::BlobLen(slot) => {
                    if slot >= self.ro_slots {
                        return Err(bad("ro slot out of range"));
                    }
                }
                Opcode::StoreB(slot) | Opcode::StoreW(slot) => {
                    if slot as usize >= self.rw_slots.len() {
                        return Err(bad("rw slot out of range"));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::Opcode::*;
    use crate::vm::Value::*;

    fn sample() -> Module {
        Module {
            name: "sample".to_string(),
            inputs: 2,
            outputs: 1,
            ro_slots: 2,
            rw_slots: vec![64, 16],
            data: vec![Int(0), Int(4), Bool(true), Addr(3)],
            code: vec![
                LoadI(0),
                LoadI(1),
                Binary(BinOp::Add),
                LoadI(2),
                LoadI(3),
                BranchTrue,
                Host(HostCall::DesignateOutput),
                Halt,
            ],
        }
    }

    #[test]
    fn test_roundtrip() {
        let module = sample();
        let bytes = module.encode().unwrap();
        assert_eq!(Module::decode(&bytes).unwrap(), module);
    }

    #[test]
    fn test_encoding_is_stable() {
        // Same module, same bytes: the module's Name depends on it.
        assert_eq!(sample().encode().unwrap(), sample().encode().unwrap());
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = b'x';
        assert_eq!(Module::decode(&bytes), Err(Trap::BadModule("bad magic".to_string())));
    }

    #[test]
    fn test_truncation() {
        let bytes = sample().encode().unwrap();
        for cut in 0..bytes.len() {
            assert!(Module::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_trailing_bytes() {
        let mut bytes = sample().encode().unwrap();
        bytes.push(0);
        assert_eq!(
            Module::decode(&bytes),
            Err(Trap::BadModule("trailing bytes".to_string()))
        );
    }

    #[test]
    fn test_constant_index_out_of_range() {
        let mut module = sample();
        module.code.push(LoadI(99));
        let bytes = module.encode().unwrap();
        assert_eq!(
            Module::decode(&bytes),
            Err(Trap::BadModule("constant index out of range".to_string()))
        );
    }

    #[test]
    fn test_slot_operands_are_validated() {
        let mut module = sample();
        module.code.push(LoadW(7));
        let bytes = module.encode().unwrap();
        assert_eq!(
            Module::decode(&bytes),
            Err(Trap::BadModule("ro slot out of range".to_string()))
        );
    }

    #[test]
    fn test_handle_constants_are_rejected() {
        let mut module = sample();
        module.data.push(Ref(0));
        assert_eq!(
            module.encode(),
            Err(Trap::BadModule("handle constant in data section".to_string()))
        );
    }
}
