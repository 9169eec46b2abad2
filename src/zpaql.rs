use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Result, ZpaqError};

/// Descriptor length per component kind, first byte included. Kind 0 is
/// not a component (it terminates the COMP section).
pub const COMPSIZE: [u8; 10] = [0, 2, 3, 2, 3, 4, 6, 6, 3, 5];

pub const KIND_CONST: u8 = 1;
pub const KIND_CM: u8 = 2;
pub const KIND_ICM: u8 = 3;
pub const KIND_MATCH: u8 = 4;
pub const KIND_AVG: u8 = 5;
pub const KIND_MIX2: u8 = 6;
pub const KIND_MIX: u8 = 7;
pub const KIND_ISSE: u8 = 8;
pub const KIND_SSE: u8 = 9;

/// Default per-invocation instruction ceiling. A conforming model runs a
/// few dozen instructions per byte; anything near this bound is a loop.
pub const DEFAULT_STEP_LIMIT: u64 = 1 << 26;

/// A parsed ZPAQL program as embedded in a block header: memory size
/// declarations, the component descriptor list, and the opcode stream.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub hh: u8,
    pub hm: u8,
    pub ph: u8,
    pub pm: u8,
    /// Raw descriptor bytes, `n` components back to back.
    pub comp: Vec<u8>,
    pub n: u8,
    /// Opcode stream without the terminating zero byte.
    pub hcomp: Vec<u8>,
}

impl Program {
    /// Parses the block-header form: `hsize:u16le` followed by sizes,
    /// descriptors, COMP end, opcodes, HCOMP end.
    pub fn parse<R: Read>(r: &mut R) -> Result<Program> {
        let hsize = r
            .read_u16::<LittleEndian>()
            .map_err(|_| ZpaqError::Truncated("program header"))? as usize;
        if hsize < 7 {
            return Err(ZpaqError::BadHeader("hsize too small"));
        }

        let mut body = vec![0u8; hsize];
        r.read_exact(&mut body)
            .map_err(|_| ZpaqError::Truncated("program body"))?;

        let (hh, hm, ph, pm, n) = (body[0], body[1], body[2], body[3], body[4]);
        if hh > 32 || hm > 32 || ph > 32 || pm > 32 {
            return Err(ZpaqError::BadHeader("memory size exceeds 2^32"));
        }

        let mut pos = 5usize;
        let comp_start = pos;
        for _ in 0..n {
            let kind = *body.get(pos).ok_or(ZpaqError::BadHeader("COMP overflow"))? as usize;
            if kind == 0 || kind >= COMPSIZE.len() {
                return Err(ZpaqError::BadHeader("invalid component kind"));
            }
            pos += COMPSIZE[kind] as usize;
            if pos > body.len() {
                return Err(ZpaqError::BadHeader("component overflows header"));
            }
        }
        let comp = body[comp_start..pos].to_vec();

        if body.get(pos) != Some(&0) {
            return Err(ZpaqError::BadHeader("missing COMP end"));
        }
        pos += 1;

        if pos >= body.len() {
            return Err(ZpaqError::BadHeader("missing HCOMP"));
        }
        if body[body.len() - 1] != 0 {
            return Err(ZpaqError::BadHeader("missing HCOMP end"));
        }
        let hcomp = body[pos..body.len() - 1].to_vec();

        Ok(Program {
            hh,
            hm,
            ph,
            pm,
            comp,
            n,
            hcomp,
        })
    }

    /// A post-processing program carries only opcodes; its memory sizes
    /// come from the enclosing block's `ph`/`pm` declarations.
    pub fn pcomp(ph: u8, pm: u8, ops: Vec<u8>) -> Program {
        Program {
            hh: 0,
            hm: 0,
            ph,
            pm,
            comp: Vec::new(),
            n: 0,
            hcomp: ops,
        }
    }

    pub fn hsize(&self) -> u16 {
        (5 + self.comp.len() + 1 + self.hcomp.len() + 1) as u16
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.write_u16::<LittleEndian>(self.hsize()).expect("vec write");
        out.extend_from_slice(&[self.hh, self.hm, self.ph, self.pm, self.n]);
        out.extend_from_slice(&self.comp);
        out.push(0);
        out.extend_from_slice(&self.hcomp);
        out.push(0);
    }

    /// Walks the descriptor list, yielding (kind, descriptor bytes).
    pub fn components(&self) -> impl Iterator<Item = (u8, &[u8])> {
        let mut pos = 0usize;
        let comp = &self.comp;
        std::iter::from_fn(move || {
            if pos >= comp.len() {
                return None;
            }
            let kind = comp[pos];
            let len = COMPSIZE[kind as usize] as usize;
            let desc = &comp[pos..pos + len];
            pos += len;
            Some((kind, desc))
        })
    }
}

/// The ZPAQL register machine. One instance computes contexts (`hcomp`)
/// or post-processes decoded bytes (`pcomp`); state persists across
/// invocations within a segment and is discarded at segment end.
pub struct Vm {
    ops: Vec<u8>,
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    pub f: bool,
    pc: usize,
    pub r: Vec<u32>,
    pub m: Vec<u8>,
    pub h: Vec<u32>,
    out: Vec<u8>,
    step_limit: u64,
}

impl Vm {
    /// Builds the context-computing machine sized by `hh`/`hm`.
    pub fn hcomp(prog: &Program, step_limit: u64) -> Vm {
        Vm::sized(prog.hcomp.clone(), prog.hh, prog.hm, step_limit)
    }

    /// Builds the post-processing machine sized by `ph`/`pm`.
    pub fn pcomp(prog: &Program, step_limit: u64) -> Vm {
        Vm::sized(prog.hcomp.clone(), prog.ph, prog.pm, step_limit)
    }

    fn sized(ops: Vec<u8>, hbits: u8, mbits: u8, step_limit: u64) -> Vm {
        Vm {
            ops,
            a: 0,
            b: 0,
            c: 0,
            d: 0,
            f: false,
            pc: 0,
            r: vec![0; 256],
            m: vec![0; 1usize << mbits],
            h: vec![0; 1usize << hbits],
            out: Vec::new(),
            step_limit,
        }
    }

    pub fn h(&self, i: usize) -> u32 {
        self.h[i & (self.h.len() - 1)]
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Runs the program once with `input` in A, until HALT.
    pub fn run(&mut self, input: u32) -> Result<()> {
        self.pc = 0;
        self.a = input;
        let mut steps = 0u64;

        loop {
            steps += 1;
            if steps > self.step_limit {
                return Err(ZpaqError::VmRuntime("instruction limit exceeded"));
            }
            if !self.step()? {
                return Ok(());
            }
        }
    }

    fn fetch(&mut self) -> Result<u8> {
        let b = *self
            .ops
            .get(self.pc)
            .ok_or(ZpaqError::VmRuntime("program counter out of range"))?;
        self.pc += 1;
        Ok(b)
    }

    fn m_ref(&mut self, idx: u32) -> &mut u8 {
        let mask = self.m.len() - 1;
        &mut self.m[idx as usize & mask]
    }

    fn h_ref(&mut self, idx: u32) -> &mut u32 {
        let mask = self.h.len() - 1;
        &mut self.h[idx as usize & mask]
    }

    fn m_get(&self, idx: u32) -> u32 {
        self.m[idx as usize & (self.m.len() - 1)] as u32
    }

    fn h_get(&self, idx: u32) -> u32 {
        self.h[idx as usize & (self.h.len() - 1)]
    }

    /// Reads the operand selected by the low 3 bits of a binary opcode.
    fn operand(&mut self, sel: u8) -> Result<u32> {
        Ok(match sel {
            0 => self.a,
            1 => self.b,
            2 => self.c,
            3 => self.d,
            4 => self.m_get(self.b),
            5 => self.m_get(self.c),
            6 => self.h_get(self.d),
            _ => self.fetch()? as u32,
        })
    }

    fn jump(&mut self, taken: bool) -> Result<()> {
        // Offset is signed 8-bit, relative to the offset byte itself
        // plus one; the not-taken path just skips the offset byte.
        if taken {
            let off = *self
                .ops
                .get(self.pc)
                .ok_or(ZpaqError::VmRuntime("jump offset out of range"))? as i32;
            let target = self.pc as i32 + ((off + 128) & 255) - 127;
            if target < 0 || target as usize > self.ops.len() {
                return Err(ZpaqError::VmRuntime("jump target out of range"));
            }
            self.pc = target as usize;
        } else {
            self.pc += 1;
        }
        Ok(())
    }

    /// Executes one instruction; false means HALT.
    fn step(&mut self) -> Result<bool> {
        let op = self.fetch()?;

        match op {
            1 => self.a = self.a.wrapping_add(1),
            2 => self.a = self.a.wrapping_sub(1),
            3 => self.a = !self.a,
            4 => self.a = 0,
            7 => {
                let idx = self.fetch()? as usize;
                self.a = self.r[idx];
            }

            8 => std::mem::swap(&mut self.a, &mut self.b),
            9 => self.b = self.b.wrapping_add(1),
            10 => self.b = self.b.wrapping_sub(1),
            11 => self.b = !self.b,
            12 => self.b = 0,
            15 => {
                let idx = self.fetch()? as usize;
                self.b = self.r[idx];
            }

            16 => std::mem::swap(&mut self.a, &mut self.c),
            17 => self.c = self.c.wrapping_add(1),
            18 => self.c = self.c.wrapping_sub(1),
            19 => self.c = !self.c,
            20 => self.c = 0,
            23 => {
                let idx = self.fetch()? as usize;
                self.c = self.r[idx];
            }

            24 => std::mem::swap(&mut self.a, &mut self.d),
            25 => self.d = self.d.wrapping_add(1),
            26 => self.d = self.d.wrapping_sub(1),
            27 => self.d = !self.d,
            28 => self.d = 0,
            31 => {
                let idx = self.fetch()? as usize;
                self.d = self.r[idx];
            }

            // Swap of A's low byte with M[B] / M[C], expressed as the
            // xor dance so A's high bytes survive.
            32 | 40 => {
                let idx = if op == 32 { self.b } else { self.c };
                let mval = self.m_get(idx);
                self.a ^= mval;
                let new_m = (mval ^ self.a) as u8;
                *self.m_ref(idx) = new_m;
                self.a ^= new_m as u32;
            }
            33 | 41 => {
                let idx = if op == 33 { self.b } else { self.c };
                let m = self.m_ref(idx);
                *m = m.wrapping_add(1);
            }
            34 | 42 => {
                let idx = if op == 34 { self.b } else { self.c };
                let m = self.m_ref(idx);
                *m = m.wrapping_sub(1);
            }
            35 | 43 => {
                let idx = if op == 35 { self.b } else { self.c };
                let m = self.m_ref(idx);
                *m = !*m;
            }
            36 | 44 => {
                let idx = if op == 36 { self.b } else { self.c };
                *self.m_ref(idx) = 0;
            }
            39 => {
                let taken = self.f;
                self.jump(taken)?;
            }
            47 => {
                let taken = !self.f;
                self.jump(taken)?;
            }

            48 => {
                let d = self.d;
                let a = self.a;
                let hval = self.h_get(d);
                *self.h_ref(d) = a;
                self.a = hval;
            }
            49 => {
                let d = self.d;
                let h = self.h_ref(d);
                *h = h.wrapping_add(1);
            }
            50 => {
                let d = self.d;
                let h = self.h_ref(d);
                *h = h.wrapping_sub(1);
            }
            51 => {
                let d = self.d;
                let h = self.h_ref(d);
                *h = !*h;
            }
            52 => {
                let d = self.d;
                *self.h_ref(d) = 0;
            }
            55 => {
                let idx = self.fetch()? as usize;
                self.r[idx] = self.a;
            }
            56 => return Ok(false),
            57 => self.out.push((self.a & 255) as u8),
            59 => {
                let mb = self.m_get(self.b);
                self.a = self
                    .a
                    .wrapping_add(mb)
                    .wrapping_add(512)
                    .wrapping_mul(773);
            }
            60 => {
                let d = self.d;
                let a = self.a;
                let hd = self.h_ref(d);
                *hd = hd.wrapping_add(a).wrapping_add(512).wrapping_mul(773);
            }
            63 => self.jump(true)?,

            64..=239 => {
                let v = self.operand(op & 7)?;
                match op >> 3 {
                    8 => self.a = v,
                    9 => self.b = v,
                    10 => self.c = v,
                    11 => self.d = v,
                    12 => *self.m_ref(self.b) = v as u8,
                    13 => *self.m_ref(self.c) = v as u8,
                    14 => *self.h_ref(self.d) = v,
                    16 => self.a = self.a.wrapping_add(v),
                    17 => self.a = self.a.wrapping_sub(v),
                    18 => self.a = self.a.wrapping_mul(v),
                    19 => self.a = if v == 0 { 0 } else { self.a / v },
                    20 => self.a = if v == 0 { 0 } else { self.a % v },
                    21 => self.a &= v,
                    22 => self.a &= !v,
                    23 => self.a |= v,
                    24 => self.a ^= v,
                    25 => self.a <<= v & 31,
                    26 => self.a >>= v & 31,
                    27 => self.f = self.a == v,
                    28 => self.f = self.a < v,
                    29 => self.f = self.a > v,
                    _ => return Err(ZpaqError::VmRuntime("illegal opcode")),
                }
            }

            255 => {
                let lo = self.fetch()? as usize;
                let hi = self.fetch()? as usize;
                let target = lo | (hi << 8);
                if target >= self.ops.len() {
                    return Err(ZpaqError::VmRuntime("long jump out of range"));
                }
                self.pc = target;
            }

            _ => return Err(ZpaqError::VmRuntime("illegal opcode")),
        }
        Ok(true)
    }
}
