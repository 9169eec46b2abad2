use std::sync::OnceLock;

use crate::error::{Result, ZpaqError};
use crate::zpaql::{self, Program, Vm};

/// Context-mixing predictor array.
///
/// The component chain is declared by the embedded program's COMP section;
/// each component maps (its context seed from H, earlier outputs) to a
/// stretch-domain value, and the final component's output squashed to a
/// 12-bit probability drives the coder. Everything here is integer
/// arithmetic over precomputed tables, so encoder and decoder trajectories
/// are bit-identical on any platform.
const PMAX: i32 = 4095;

/// Bit-history successor table: NEX[state][bit]. State 0 is the empty
/// history; states drift toward longer run memories.
const NEX: [[u8; 2]; 256] = [
    [1, 2], [3, 5], [4, 6], [7, 10], [8, 12], [9, 13], [11, 14], [15, 19],
    [16, 23], [17, 24], [18, 25], [20, 27], [21, 28], [22, 29], [26, 30], [31, 33],
    [32, 35], [32, 35], [32, 35], [32, 35], [34, 37], [34, 37], [34, 37], [34, 37],
    [34, 37], [34, 37], [36, 39], [36, 39], [36, 39], [36, 39], [38, 40], [41, 43],
    [42, 45], [42, 45], [44, 47], [44, 47], [46, 49], [46, 49], [48, 51], [48, 51],
    [50, 52], [53, 43], [54, 57], [54, 57], [56, 59], [56, 59], [58, 61], [58, 61],
    [60, 63], [60, 63], [62, 65], [62, 65], [50, 66], [67, 55], [68, 57], [68, 57],
    [70, 73], [70, 73], [72, 75], [72, 75], [74, 77], [74, 77], [76, 79], [76, 79],
    [62, 81], [62, 81], [64, 82], [83, 69], [84, 71], [84, 71], [86, 73], [86, 73],
    [44, 59], [44, 59], [58, 61], [58, 61], [60, 49], [60, 49], [76, 89], [76, 89],
    [78, 91], [78, 91], [80, 92], [93, 69], [94, 87], [94, 87], [96, 45], [96, 45],
    [48, 99], [48, 99], [88, 101], [88, 101], [80, 102], [103, 69], [104, 87], [104, 87],
    [106, 57], [106, 57], [62, 109], [62, 109], [88, 111], [88, 111], [80, 112], [113, 85],
    [114, 87], [114, 87], [116, 57], [116, 57], [62, 119], [62, 119], [88, 121], [88, 121],
    [90, 122], [123, 85], [124, 97], [124, 97], [126, 57], [126, 57], [62, 129], [62, 129],
    [98, 131], [98, 131], [90, 132], [133, 85], [134, 97], [134, 97], [136, 57], [136, 57],
    [62, 139], [62, 139], [98, 141], [98, 141], [90, 142], [143, 95], [144, 97], [144, 97],
    [68, 57], [68, 57], [62, 81], [62, 81], [98, 147], [98, 147], [100, 148], [149, 95],
    [150, 107], [150, 107], [108, 151], [108, 151], [100, 152], [153, 95], [154, 107], [108, 155],
    [100, 156], [157, 95], [158, 107], [108, 159], [100, 160], [161, 105], [162, 107], [108, 163],
    [110, 164], [165, 105], [166, 117], [118, 167], [110, 168], [169, 105], [170, 117], [118, 171],
    [110, 172], [173, 105], [174, 117], [118, 175], [110, 176], [177, 105], [178, 117], [118, 179],
    [110, 180], [181, 115], [182, 117], [118, 183], [120, 184], [185, 115], [186, 127], [128, 187],
    [120, 188], [189, 115], [190, 127], [128, 191], [120, 192], [193, 115], [194, 127], [128, 195],
    [120, 196], [197, 115], [198, 127], [128, 199], [120, 200], [201, 115], [202, 127], [128, 203],
    [120, 204], [205, 115], [206, 127], [128, 207], [120, 208], [209, 125], [210, 127], [128, 211],
    [130, 212], [213, 125], [214, 137], [138, 215], [130, 216], [217, 125], [218, 137], [138, 219],
    [130, 220], [221, 125], [222, 137], [138, 223], [130, 224], [225, 125], [226, 137], [138, 227],
    [130, 228], [229, 125], [230, 137], [138, 231], [130, 232], [233, 125], [234, 137], [138, 235],
    [130, 236], [237, 125], [238, 137], [138, 239], [130, 240], [241, 125], [242, 137], [138, 243],
    [130, 244], [245, 135], [246, 137], [138, 247], [140, 248], [249, 135], [250, 69], [80, 251],
    [140, 252], [249, 135], [250, 69], [80, 251], [140, 252], [0, 0], [0, 0], [0, 0],
];

fn next_state(state: u8, bit: u32) -> u8 {
    NEX[state as usize][bit as usize & 1]
}

// Logistic curve, 12-bit: squash(x) ~ 4096 / (1 + e^(-x/256)).
fn squash(d: i32) -> i32 {
    const T: [i32; 33] = [
        1, 2, 3, 6, 10, 16, 27, 45, 73, 120, 194, 310, 488, 747, 1101, 1546, 2047, 2549, 2994,
        3348, 3607, 3785, 3901, 3975, 4022, 4050, 4068, 4079, 4085, 4089, 4092, 4093, 4094,
    ];

    if d > 2047 {
        return 4095;
    }
    if d < -2047 {
        return 0;
    }
    let w = d & 127;
    let d = ((d >> 7) + 16) as usize;
    (T[d] * (128 - w) + T[d + 1] * w + 64) >> 7
}

struct Tables {
    /// Inverse of squash: probability 0..4095 -> domain -2047..2047.
    stretch: [i16; 4096],
    /// rcp[n] = 65536 / (n + 1), the adaptation step at count n.
    rcp: [i32; 1024],
}

fn tables() -> &'static Tables {
    static TABLES: OnceLock<Tables> = OnceLock::new();
    TABLES.get_or_init(|| {
        let mut stretch = [0i16; 4096];
        let mut pi = 0i32;
        for x in -2047..=2047i32 {
            let i = squash(x);
            for j in pi..=i {
                stretch[j as usize] = x as i16;
            }
            pi = i + 1;
        }
        stretch[4095] = 2047;

        let mut rcp = [0i32; 1024];
        for (n, r) in rcp.iter_mut().enumerate() {
            *r = 65536 / (n as i32 + 1);
        }

        Tables { stretch, rcp }
    })
}

fn stretch(p: i32) -> i32 {
    tables().stretch[p.clamp(0, PMAX) as usize] as i32
}

fn clamp2k(x: i32) -> i32 {
    x.clamp(-2048, 2047)
}

fn clamp512k(x: i32) -> i32 {
    x.clamp(-524_288, 524_287)
}

/// One adaptive cell: prediction in the high 22 bits, observation count
/// in the low 10. The neutral cell is p = 1/2, count = 0.
const NEUTRAL_CELL: u32 = 1 << 31;

fn cell_p(cell: u32) -> i32 {
    (cell >> 20) as i32
}

/// Moves the cell prediction toward the observed bit with step
/// 1/(count+1), saturating the count at `limit`.
fn train(cell: u32, bit: u32, limit: u32) -> u32 {
    let count = cell & 1023;
    let p22 = (cell >> 10) as i64;
    let target = ((bit as i64) << 22) as i64;
    let step = tables().rcp[count as usize] as i64;

    let np = (p22 + ((target - p22) * step >> 16)).clamp(0, (1 << 22) - 1) as u32;
    let nc = if count < limit { count + 1 } else { count };
    (np << 10) | nc
}

/// Hashed bucket lookup for indirect components: 16-slot buckets with an
/// 8-bit check byte in slot 0 and bit-history states in slots 1..15.
/// Misses evict the bucket whose slot-1 state is least advanced.
fn find(ht: &mut [u8], sizebits: u32, cxt: u32) -> usize {
    let size = ht.len();
    let chk = ((cxt >> sizebits) & 255) as u8;
    let h0 = (cxt as usize * 16) & (size - 16);
    if ht[h0] == chk {
        return h0;
    }
    let h1 = h0 ^ 16;
    if ht[h1] == chk {
        return h1;
    }
    let h2 = h0 ^ 32;
    if ht[h2] == chk {
        return h2;
    }

    let r = if ht[h0 + 1] <= ht[h1 + 1] && ht[h0 + 1] <= ht[h2 + 1] {
        h0
    } else if ht[h1 + 1] < ht[h2 + 1] {
        h1
    } else {
        h2
    };
    ht[r..r + 16].fill(0);
    ht[r] = chk;
    r
}

enum Comp {
    Const,
    Cm {
        limit: u32,
        t: Vec<u32>,
        cxt: usize,
    },
    Icm {
        sizebits: u32,
        ht: Vec<u8>,
        sm: Vec<u32>,
        bucket: usize,
        state: u8,
    },
    Match {
        cm: Vec<u32>,
        buf: Vec<u8>,
        pos: usize,
        len: usize,
        off: usize,
        bit: u32,
        word: u8,
        pred: u32,
    },
    Avg {
        j: usize,
        k: usize,
        wt: i32,
    },
    Mix2 {
        j: usize,
        k: usize,
        rate: i32,
        mask: u32,
        w: Vec<u16>,
        cxt: usize,
    },
    Mix {
        j: usize,
        m: usize,
        rate: i32,
        mask: u32,
        w: Vec<i32>,
        cxt: usize,
    },
    Isse {
        sizebits: u32,
        j: usize,
        ht: Vec<u8>,
        w: Vec<i32>,
        bucket: usize,
        state: u8,
    },
    Sse {
        limit: u32,
        j: usize,
        t: Vec<u32>,
        cxt: usize,
    },
}

pub struct Predictor {
    comps: Vec<Comp>,
    /// Stretch-domain output of each component for the current bit.
    p: Vec<i32>,
    /// Per-component context seeds, copied from the VM's H after each byte.
    h: Vec<u32>,
    vm: Vm,
    c8: u32,
    hmap4: u32,
}

impl Predictor {
    pub fn new(prog: &Program, step_limit: u64) -> Result<Predictor> {
        let n = prog.n as usize;
        let mut comps = Vec::with_capacity(n);

        for (i, (kind, desc)) in prog.components().enumerate() {
            let comp = match kind {
                zpaql::KIND_CONST => Comp::Const,
                zpaql::KIND_CM => {
                    let sizebits = desc[1].min(26) as u32;
                    Comp::Cm {
                        limit: (desc[2] as u32 * 4).min(1023),
                        t: vec![NEUTRAL_CELL; 1 << sizebits],
                        cxt: 0,
                    }
                }
                zpaql::KIND_ICM => {
                    let sizebits = (desc[1].min(26) as u32) + 2;
                    Comp::Icm {
                        sizebits,
                        ht: vec![0; 16 << sizebits],
                        sm: vec![NEUTRAL_CELL; 256],
                        bucket: 0,
                        state: 0,
                    }
                }
                zpaql::KIND_MATCH => {
                    let sizebits = desc[1].min(26) as u32;
                    let bufbits = desc[2].min(26) as u32;
                    Comp::Match {
                        cm: vec![0; 1 << sizebits],
                        buf: vec![0; 1 << bufbits],
                        pos: 0,
                        len: 0,
                        off: 0,
                        bit: 0,
                        word: 0,
                        pred: 0,
                    }
                }
                zpaql::KIND_AVG => {
                    let (j, k) = (desc[1] as usize, desc[2] as usize);
                    if j >= i || k >= i {
                        return Err(ZpaqError::BadHeader("AVG references a later component"));
                    }
                    Comp::Avg {
                        j,
                        k,
                        wt: desc[3] as i32,
                    }
                }
                zpaql::KIND_MIX2 => {
                    let sizebits = desc[1].min(26) as u32;
                    let (j, k) = (desc[2] as usize, desc[3] as usize);
                    if j >= i || k >= i {
                        return Err(ZpaqError::BadHeader("MIX2 references a later component"));
                    }
                    Comp::Mix2 {
                        j,
                        k,
                        rate: desc[4] as i32,
                        mask: desc[5] as u32,
                        w: vec![32768; 1 << sizebits],
                        cxt: 0,
                    }
                }
                zpaql::KIND_MIX => {
                    let sizebits = desc[1].min(26) as u32;
                    let j = desc[2] as usize;
                    let m = (desc[3] as usize).max(1);
                    if j + m > i {
                        return Err(ZpaqError::BadHeader("MIX references a later component"));
                    }
                    Comp::Mix {
                        j,
                        m,
                        rate: desc[4] as i32,
                        mask: desc[5] as u32,
                        w: vec![65536 / m as i32; m << sizebits],
                        cxt: 0,
                    }
                }
                zpaql::KIND_ISSE => {
                    let sizebits = (desc[1].min(26) as u32) + 2;
                    let j = desc[2] as usize;
                    if j >= i {
                        return Err(ZpaqError::BadHeader("ISSE references a later component"));
                    }
                    let mut w = vec![0i32; 512];
                    for s in 0..256 {
                        w[s * 2] = 1 << 15;
                    }
                    Comp::Isse {
                        sizebits,
                        j,
                        ht: vec![0; 16 << sizebits],
                        w,
                        bucket: 0,
                        state: 0,
                    }
                }
                zpaql::KIND_SSE => {
                    let sizebits = desc[1].min(26) as u32;
                    let j = desc[2] as usize;
                    if j >= i {
                        return Err(ZpaqError::BadHeader("SSE references a later component"));
                    }
                    let start = (desc[3] as u32).min(1023);
                    let limit = (desc[4] as u32 * 4).min(1023);
                    let mut t = vec![0u32; 32 << sizebits];
                    for (idx, cell) in t.iter_mut().enumerate() {
                        let p = squash(((idx & 31) as i32) * 128 - 1984) as u32;
                        *cell = (p << 20) | start;
                    }
                    Comp::Sse {
                        limit,
                        j,
                        t,
                        cxt: 0,
                    }
                }
                _ => return Err(ZpaqError::BadHeader("invalid component kind")),
            };
            comps.push(comp);
        }

        if comps.len() != n {
            return Err(ZpaqError::BadHeader("component count mismatch"));
        }

        // CONST output never changes; seed it once.
        let mut p = vec![0i32; n];
        for (i, (kind, desc)) in prog.components().enumerate() {
            if kind == zpaql::KIND_CONST {
                p[i] = (desc[1] as i32 - 128) * 16;
            }
        }

        Ok(Predictor {
            comps,
            p,
            h: vec![0; n],
            vm: Vm::hcomp(prog, step_limit),
            c8: 1,
            hmap4: 1,
        })
    }

    pub fn is_modeled(&self) -> bool {
        !self.comps.is_empty()
    }

    /// 12-bit probability that the next bit is 1.
    pub fn predict(&mut self) -> i32 {
        let n = self.comps.len();
        for i in 0..n {
            let hi = self.h[i];
            let (c8, hmap4) = (self.c8, self.hmap4);
            // Split so a component can read earlier outputs while
            // mutating its own state.
            let (done, rest) = self.p.split_at_mut(i);
            let out = &mut rest[0];

            match &mut self.comps[i] {
                Comp::Const => {}
                Comp::Cm { t, cxt, .. } => {
                    *cxt = (hi ^ hmap4) as usize & (t.len() - 1);
                    *out = stretch(cell_p(t[*cxt]));
                }
                Comp::Icm {
                    sizebits,
                    ht,
                    sm,
                    bucket,
                    state,
                } => {
                    if c8 == 1 || (c8 & 0xf0) == 16 {
                        *bucket = find(ht, *sizebits, hi.wrapping_add(c8 * 16));
                    }
                    *state = ht[*bucket + (hmap4 as usize & 15)];
                    *out = stretch(cell_p(sm[*state as usize]));
                }
                Comp::Match {
                    buf,
                    pos,
                    len,
                    off,
                    bit,
                    pred,
                    ..
                } => {
                    if *len == 0 {
                        *out = 0;
                    } else {
                        let idx = pos.wrapping_sub(*off) & (buf.len() - 1);
                        *pred = (buf[idx] as u32 >> (7 - *bit)) & 1;
                        let conf = 64 * (*len).min(31) as i32;
                        *out = if *pred == 1 { conf } else { -conf };
                    }
                }
                Comp::Avg { j, k, wt } => {
                    *out = (done[*j] * *wt + done[*k] * (256 - *wt)) >> 8;
                }
                Comp::Mix2 {
                    j,
                    k,
                    mask,
                    w,
                    cxt,
                    ..
                } => {
                    *cxt = hi.wrapping_add(c8 & *mask) as usize & (w.len() - 1);
                    let wt = w[*cxt] as i32;
                    *out = clamp2k((wt * done[*j] + (65536 - wt) * done[*k]) >> 16);
                }
                Comp::Mix {
                    j,
                    m,
                    mask,
                    w,
                    cxt,
                    ..
                } => {
                    let nctx = w.len() / *m;
                    *cxt = (hi.wrapping_add(c8 & *mask) as usize & (nctx - 1)) * *m;
                    let mut sum = 0i64;
                    for t in 0..*m {
                        sum += w[*cxt + t] as i64 * done[*j + t] as i64;
                    }
                    *out = clamp2k((sum >> 16) as i32);
                }
                Comp::Isse {
                    sizebits,
                    j,
                    ht,
                    w,
                    bucket,
                    state,
                } => {
                    if c8 == 1 || (c8 & 0xf0) == 16 {
                        *bucket = find(ht, *sizebits, hi.wrapping_add(c8 * 16));
                    }
                    *state = ht[*bucket + (hmap4 as usize & 15)];
                    let w0 = w[*state as usize * 2];
                    let w1 = w[*state as usize * 2 + 1];
                    *out = clamp2k(((w0 as i64 * done[*j] as i64 + w1 as i64 * 64) >> 16) as i32);
                }
                Comp::Sse { j, t, cxt, .. } => {
                    let nctx = t.len() >> 5;
                    let base = (hi.wrapping_add(c8) as usize & (nctx - 1)) * 32;
                    let pq = (done[*j] + 1984).clamp(0, 3967);
                    let wt = pq & 127;
                    *cxt = base + (pq >> 7) as usize;
                    let v0 = cell_p(t[*cxt]);
                    let v1 = cell_p(t[*cxt + 1]);
                    *out = stretch((v0 * (128 - wt) + v1 * wt) >> 7);
                }
            }
        }

        squash(self.p[n - 1])
    }

    /// Folds the observed bit into every component, and at byte
    /// boundaries runs the context program for the next byte.
    pub fn update(&mut self, bit: u32) -> Result<()> {
        let n = self.comps.len();
        for i in 0..n {
            let hi = self.h[i];
            let hmap4 = self.hmap4;
            let p_i = self.p[i];
            let (done, _) = self.p.split_at(i);

            match &mut self.comps[i] {
                Comp::Const => {}
                Comp::Cm { limit, t, cxt } => {
                    t[*cxt] = train(t[*cxt], bit, *limit);
                }
                Comp::Icm {
                    ht,
                    sm,
                    bucket,
                    state,
                    ..
                } => {
                    ht[*bucket + (hmap4 as usize & 15)] = next_state(*state, bit);
                    sm[*state as usize] = train(sm[*state as usize], bit, 1023);
                }
                Comp::Match {
                    cm,
                    buf,
                    pos,
                    len,
                    off,
                    bit: bitpos,
                    word,
                    pred,
                } => {
                    if *len > 0 && *pred != bit {
                        *len = 0;
                    }
                    *word = word.wrapping_mul(2).wrapping_add(bit as u8);
                    *bitpos += 1;
                    if *bitpos == 8 {
                        let mask = buf.len() - 1;
                        buf[*pos & mask] = *word;
                        *word = 0;
                        *bitpos = 0;
                        *pos = (*pos + 1) & mask;

                        if *len == 0 {
                            let slot = hi as usize & (cm.len() - 1);
                            let cand = cm[slot] as usize;
                            *off = pos.wrapping_sub(cand) & mask;
                            if *off != 0 {
                                while *len < 255
                                    && *len < buf.len() - 1
                                    && buf[pos.wrapping_sub(*len + 1) & mask]
                                        == buf[pos.wrapping_sub(*len + *off + 1) & mask]
                                {
                                    *len += 1;
                                }
                            }
                        } else if *len < 255 {
                            *len += 1;
                        }
                        let slot = hi as usize & (cm.len() - 1);
                        cm[slot] = *pos as u32;
                    }
                }
                Comp::Avg { .. } => {}
                Comp::Mix2 {
                    j, k, rate, w, cxt, ..
                } => {
                    let err = (bit as i32 * PMAX - squash(p_i)) * *rate >> 5;
                    let delta = (err * (done[*j] - done[*k]) + (1 << 9)) >> 10;
                    w[*cxt] = (w[*cxt] as i32 + delta).clamp(0, 65535) as u16;
                }
                Comp::Mix {
                    j,
                    m,
                    rate,
                    w,
                    cxt,
                    ..
                } => {
                    let err = (bit as i32 * PMAX - squash(p_i)) * *rate >> 4;
                    for t in 0..*m {
                        let delta = (err * done[*j + t] + (1 << 9)) >> 10;
                        w[*cxt + t] = clamp512k(w[*cxt + t] + delta);
                    }
                }
                Comp::Isse {
                    j,
                    ht,
                    w,
                    bucket,
                    state,
                    ..
                } => {
                    let err = bit as i32 * PMAX - squash(p_i);
                    let s = *state as usize;
                    w[s * 2] = clamp512k(w[s * 2] + ((err * done[*j] + (1 << 9)) >> 10));
                    w[s * 2 + 1] = clamp512k(w[s * 2 + 1] + ((err + 2) >> 2));
                    ht[*bucket + (hmap4 as usize & 15)] = next_state(*state, bit);
                }
                Comp::Sse { limit, t, cxt, .. } => {
                    t[*cxt] = train(t[*cxt], bit, *limit);
                    t[*cxt + 1] = train(t[*cxt + 1], bit, *limit);
                }
            }
        }

        // Fold the bit into the partial-byte context; at a byte boundary
        // run hcomp so H holds the next byte's context seeds.
        self.c8 = self.c8 * 2 + bit;
        if self.c8 >= 256 {
            let byte = self.c8 - 256;
            self.vm.run(byte)?;
            self.vm.take_output();
            for i in 0..n {
                self.h[i] = self.vm.h(i);
            }
            self.c8 = 1;
            self.hmap4 = 1;
        } else if (16..32).contains(&self.c8) {
            self.hmap4 = (self.hmap4 & 0xf) << 5 | (bit << 4) | 1;
        } else {
            self.hmap4 = (self.hmap4 & 0x1f0) | ((self.hmap4 & 0xf) * 2 + bit) & 0xf;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Method;

    #[test]
    fn squash_is_monotonic_and_bounded() {
        let mut last = -1;
        for x in -3000..3000 {
            let p = squash(x);
            assert!((0..=PMAX).contains(&p));
            assert!(p >= last);
            last = p;
        }
        assert_eq!(squash(-3000), 0);
        assert_eq!(squash(3000), PMAX);
    }

    #[test]
    fn stretch_inverts_squash() {
        for x in (-2047..=2047).step_by(13) {
            let p = squash(x);
            let back = stretch(p);
            assert!((back - x).abs() <= 32, "x={} p={} back={}", x, p, back);
        }
    }

    #[test]
    fn train_moves_toward_bit() {
        let cell = NEUTRAL_CELL;
        let up = train(cell, 1, 1023);
        let down = train(cell, 0, 1023);
        assert!(cell_p(up) > cell_p(cell));
        assert!(cell_p(down) < cell_p(cell));
        // Count 0 means a full step to the observed bit.
        assert_eq!(cell_p(up), PMAX);
        assert_eq!(cell_p(down), 0);
    }

    #[test]
    fn train_step_shrinks_with_count() {
        let mut cell = NEUTRAL_CELL;
        for _ in 0..8 {
            cell = train(cell, 1, 1023);
        }
        let before = cell_p(cell);
        let after = cell_p(train(cell, 0, 1023));
        // After several observations a single opposite bit must not slam
        // the prediction back to the floor.
        assert!(after > 0);
        assert!(after < before);
    }

    #[test]
    fn state_table_covers_both_branches() {
        for s in 0..=252u8 {
            let n0 = next_state(s, 0);
            let n1 = next_state(s, 1);
            assert!((n0 as usize) < 256);
            assert!((n1 as usize) < 256);
            if s > 0 {
                assert_ne!((n0, n1), (0, 0), "live state {} dead-ends", s);
            }
        }
    }

    #[test]
    fn predictions_are_deterministic() {
        let prog = Method::preset(3).program().expect("preset 3");
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 7 % 251) as u8).collect();

        let run = |data: &[u8]| -> Vec<i32> {
            let mut pr = Predictor::new(&prog, zpaql::DEFAULT_STEP_LIMIT).expect("predictor");
            let mut out = Vec::new();
            for &byte in data {
                for i in (0..8).rev() {
                    out.push(pr.predict());
                    pr.update((byte as u32 >> i) & 1).expect("update");
                }
            }
            out
        };

        assert_eq!(run(&data), run(&data));
    }

    #[test]
    fn learned_stream_gets_confident() {
        let prog = Method::preset(1).program().expect("preset 1");
        let mut pr = Predictor::new(&prog, zpaql::DEFAULT_STEP_LIMIT).expect("predictor");

        // Feed a long run of zero bytes; predictions should sink well
        // below the neutral 2048.
        let mut last_p = 2048;
        for _ in 0..4096 {
            for _ in 0..8 {
                last_p = pr.predict();
                pr.update(0).expect("update");
            }
        }
        assert!(last_p < 512, "still unsure after 4 KiB of zeros: {}", last_p);
    }
}
