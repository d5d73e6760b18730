//! PPU instruction decoder
//!
//! Decoding maps a raw instruction word to a [`PpuOpcode`]. The opcode's
//! index doubles as the interpreter-cache token stored in the executable
//! address table, so a cached entry can be executed without decoding again.

macro_rules! ppu_opcodes {
    ($($name:ident => $mnemonic:literal,)*) => {
        /// Decoded PPU operation
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum PpuOpcode {
            $($name,)*
        }

        impl PpuOpcode {
            /// Every opcode, indexed by token
            pub const ALL: &'static [PpuOpcode] = &[$(PpuOpcode::$name,)*];

            /// Assembler mnemonic
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(PpuOpcode::$name => $mnemonic,)*
                }
            }
        }
    };
}

ppu_opcodes! {
    Unknown => "(unknown)",
    // D-form
    Tdi => "tdi",
    Twi => "twi",
    Mulli => "mulli",
    Subfic => "subfic",
    Cmpli => "cmpli",
    Cmpi => "cmpi",
    Addic => "addic",
    AddicRc => "addic.",
    Addi => "addi",
    Addis => "addis",
    Ori => "ori",
    Oris => "oris",
    Xori => "xori",
    Xoris => "xoris",
    AndiRc => "andi.",
    Lwz => "lwz",
    Lwzu => "lwzu",
    Lbz => "lbz",
    Stw => "stw",
    Stwu => "stwu",
    Stb => "stb",
    Lhz => "lhz",
    Sth => "sth",
    Lfd => "lfd",
    Stfd => "stfd",
    // DS-form
    Ld => "ld",
    Std => "std",
    // Branches
    B => "b",
    Bc => "bc",
    Sc => "sc",
    Bclr => "bclr",
    Bcctr => "bcctr",
    Isync => "isync",
    // M-form
    Rlwimi => "rlwimi",
    Rlwinm => "rlwinm",
    Rlwnm => "rlwnm",
    // X-form
    Tw => "tw",
    Td => "td",
    Lwarx => "lwarx",
    Ldarx => "ldarx",
    Stwcx => "stwcx.",
    Stdcx => "stdcx.",
    And => "and",
    Or => "or",
    Xor => "xor",
    Nor => "nor",
    Cmp => "cmp",
    Cmpl => "cmpl",
    Lwzx => "lwzx",
    Stwx => "stwx",
    Ldx => "ldx",
    Stdx => "stdx",
    Mfspr => "mfspr",
    Mtspr => "mtspr",
    Mftb => "mftb",
    Sync => "sync",
    Eieio => "eieio",
    Dcbz => "dcbz",
    // XO-form
    Add => "add",
    Subf => "subf",
    Neg => "neg",
    Mullw => "mullw",
    Mulld => "mulld",
    Divw => "divw",
    Divwu => "divwu",
    // Floating point
    Fadd => "fadd",
    Fsub => "fsub",
    Fmul => "fmul",
    Fmadd => "fmadd",
    Fadds => "fadds",
    Fmr => "fmr",
}

impl PpuOpcode {
    /// Interpreter-cache token
    #[inline]
    pub fn token(self) -> u16 {
        self as u16
    }

    /// Opcode for a cache token
    #[inline]
    pub fn from_token(token: u16) -> Option<Self> {
        Self::ALL.get(token as usize).copied()
    }

    /// Instruction ends sequential execution
    pub fn is_branch(self) -> bool {
        matches!(
            self,
            PpuOpcode::B | PpuOpcode::Bc | PpuOpcode::Bclr | PpuOpcode::Bcctr | PpuOpcode::Sc
        )
    }

    /// Instruction may call out of the core (kernel, trap handler)
    pub fn is_call_out(self) -> bool {
        matches!(
            self,
            PpuOpcode::Sc
                | PpuOpcode::Tw
                | PpuOpcode::Td
                | PpuOpcode::Twi
                | PpuOpcode::Tdi
                | PpuOpcode::Unknown
        )
    }
}

/// PPU instruction decoder
pub struct PpuDecoder;

impl PpuDecoder {
    /// Decode a 32-bit PPU instruction
    pub fn decode(opcode: u32) -> PpuOpcode {
        use PpuOpcode::*;

        let op = (opcode >> 26) & 0x3F;
        match op {
            2 => Tdi,
            3 => Twi,
            7 => Mulli,
            8 => Subfic,
            10 => Cmpli,
            11 => Cmpi,
            12 => Addic,
            13 => AddicRc,
            14 => Addi,
            15 => Addis,
            16 => Bc,
            17 if opcode & 2 != 0 => Sc,
            18 => B,
            19 => match (opcode >> 1) & 0x3FF {
                16 => Bclr,
                528 => Bcctr,
                150 => Isync,
                _ => Unknown,
            },
            20 => Rlwimi,
            21 => Rlwinm,
            23 => Rlwnm,
            24 => Ori,
            25 => Oris,
            26 => Xori,
            27 => Xoris,
            28 => AndiRc,
            31 => Self::decode_group31(opcode),
            32 => Lwz,
            33 => Lwzu,
            34 => Lbz,
            36 => Stw,
            37 => Stwu,
            38 => Stb,
            40 => Lhz,
            44 => Sth,
            50 => Lfd,
            54 => Stfd,
            58 if opcode & 3 == 0 => Ld,
            62 if opcode & 3 == 0 => Std,
            59 => match (opcode >> 1) & 0x1F {
                21 => Fadds,
                _ => Unknown,
            },
            63 => match (opcode >> 1) & 0x1F {
                20 => Fsub,
                21 => Fadd,
                25 => Fmul,
                29 => Fmadd,
                _ if (opcode >> 1) & 0x3FF == 72 => Fmr,
                _ => Unknown,
            },
            _ => Unknown,
        }
    }

    fn decode_group31(opcode: u32) -> PpuOpcode {
        use PpuOpcode::*;

        let x = match (opcode >> 1) & 0x3FF {
            0 => Cmp,
            4 => Tw,
            20 => Lwarx,
            21 => Ldx,
            23 => Lwzx,
            28 => And,
            32 => Cmpl,
            68 => Td,
            84 => Ldarx,
            124 => Nor,
            149 => Stdx,
            150 if opcode & 1 != 0 => Stwcx,
            151 => Stwx,
            214 if opcode & 1 != 0 => Stdcx,
            316 => Xor,
            339 => Mfspr,
            371 => Mftb,
            444 => Or,
            467 => Mtspr,
            598 => Sync,
            854 => Eieio,
            1014 => Dcbz,
            _ => Unknown,
        };
        if x != Unknown {
            return x;
        }

        // XO-form: the OE bit sits above a 9-bit extended opcode
        match (opcode >> 1) & 0x1FF {
            40 => Subf,
            104 => Neg,
            233 => Mulld,
            235 => Mullw,
            266 => Add,
            459 => Divwu,
            491 => Divw,
            _ => Unknown,
        }
    }

    /// Extract D-form fields
    #[inline]
    pub fn d_form(opcode: u32) -> (u8, u8, i16) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let d = (opcode & 0xFFFF) as i16;
        (rt, ra, d)
    }

    /// Extract DS-form fields (displacement already scaled)
    #[inline]
    pub fn ds_form(opcode: u32) -> (u8, u8, i16) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let ds = (opcode & 0xFFFC) as i16;
        (rt, ra, ds)
    }

    /// Extract X-form fields
    #[inline]
    pub fn x_form(opcode: u32) -> (u8, u8, u8, u16, bool) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let xo = ((opcode >> 1) & 0x3FF) as u16;
        let rc = (opcode & 1) != 0;
        (rt, ra, rb, xo, rc)
    }

    /// Extract XO-form fields (integer arithmetic)
    #[inline]
    pub fn xo_form(opcode: u32) -> (u8, u8, u8, bool, u16, bool) {
        let rt = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let oe = ((opcode >> 10) & 1) != 0;
        let xo = ((opcode >> 1) & 0x1FF) as u16;
        let rc = (opcode & 1) != 0;
        (rt, ra, rb, oe, xo, rc)
    }

    /// Extract I-form fields (branch)
    #[inline]
    pub fn i_form(opcode: u32) -> (i32, bool, bool) {
        let li = ((opcode >> 2) & 0xFFFFFF) as i32;
        // Sign extend from 24 bits
        let li = if li & 0x800000 != 0 { li | !0xFFFFFF } else { li } << 2;
        let aa = ((opcode >> 1) & 1) != 0;
        let lk = (opcode & 1) != 0;
        (li, aa, lk)
    }

    /// Extract B-form fields (conditional branch)
    #[inline]
    pub fn b_form(opcode: u32) -> (u8, u8, i16, bool, bool) {
        let bo = ((opcode >> 21) & 0x1F) as u8;
        let bi = ((opcode >> 16) & 0x1F) as u8;
        let bd = ((opcode >> 2) & 0x3FFF) as i16;
        // Sign extend from 14 bits
        let bd = if bd & 0x2000 != 0 { bd | !0x3FFF } else { bd } << 2;
        let aa = ((opcode >> 1) & 1) != 0;
        let lk = (opcode & 1) != 0;
        (bo, bi, bd, aa, lk)
    }

    /// Extract M-form fields (rotate)
    #[inline]
    pub fn m_form(opcode: u32) -> (u8, u8, u8, u8, u8, bool) {
        let rs = ((opcode >> 21) & 0x1F) as u8;
        let ra = ((opcode >> 16) & 0x1F) as u8;
        let rb = ((opcode >> 11) & 0x1F) as u8;
        let mb = ((opcode >> 6) & 0x1F) as u8;
        let me = ((opcode >> 1) & 0x1F) as u8;
        let rc = (opcode & 1) != 0;
        (rs, ra, rb, mb, me, rc)
    }

    /// Extract A-form fields (floating-point)
    #[inline]
    pub fn a_form(opcode: u32) -> (u8, u8, u8, u8, bool) {
        let frt = ((opcode >> 21) & 0x1F) as u8;
        let fra = ((opcode >> 16) & 0x1F) as u8;
        let frb = ((opcode >> 11) & 0x1F) as u8;
        let frc = ((opcode >> 6) & 0x1F) as u8;
        let rc = (opcode & 1) != 0;
        (frt, fra, frb, frc, rc)
    }
}
