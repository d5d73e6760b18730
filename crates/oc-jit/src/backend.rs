//! Code generation backends
//!
//! A backend turns a chunk of guest functions into an [`ObjectCode`], checks
//! objects read back from disk, and links objects into runnable
//! [`NativeFunction`]s. Objects name the host entry points they call by
//! symbol; symbols are resolved against the [`LinkTable`] at load time.
//!
//! [`ThreadedBackend`] is the portable backend. Each guest word becomes a
//! pre-decoded op with its settings-dependent variant fixed at compile time,
//! so the linked function never re-fetches or re-decodes guest memory.

use oc_core::config::ReservationGranularity;
use oc_core::error::{JitError, PpuError};
use oc_ppu::module::{FunctionInfo, GuestModule};
use oc_ppu::reservation::Granularity;
use oc_ppu::{
    ExecHints, LinkEntry, LinkTable, NativeCode, NativeExit, NativeFunction, PpuDecoder, PpuInterpreter,
    PpuOpcode, PpuThread,
};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::hash::{covering, FORMAT};
use crate::settings::CodegenSettings;

const TOKEN_MASK: u32 = 0xFFFF;
const SYMBOL_SHIFT: u32 = 16;
const SYMBOL_MASK: u32 = 0xFF;
const FUSED_BIT: u32 = 1 << 24;
const DCBZ_BIT: u32 = 1 << 25;
const GRANULARITY_SHIFT: u32 = 26;
const GRANULARITY_MASK: u32 = 0b11;
/// Word covered by a relocation; decoded when linked
const RELOCATED_BIT: u32 = 1 << 28;
/// Leave translated code and interpret this word
const FALLBACK_BIT: u32 = 1 << 29;

/// Translated function inside an object, placed relative to its segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectFunction {
    pub segment: u16,
    pub offset: u32,
    pub ops: Vec<u32>,
}

impl ObjectFunction {
    pub fn size(&self) -> u32 {
        self.ops.len() as u32 * 4
    }
}

/// Compiled chunk as stored in the object cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectCode {
    pub name: String,
    pub format: u32,
    pub cpu: String,
    pub settings: u16,
    /// Link-table symbols referenced by the ops
    pub symbols: Vec<String>,
    pub functions: Vec<ObjectFunction>,
    pub checksum: String,
}

impl ObjectCode {
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.format.to_le_bytes());
        hasher.update(self.cpu.as_bytes());
        hasher.update(self.settings.to_le_bytes());
        for symbol in &self.symbols {
            hasher.update(symbol.as_bytes());
            hasher.update([0]);
        }
        for function in &self.functions {
            hasher.update(function.segment.to_le_bytes());
            hasher.update(function.offset.to_le_bytes());
            hasher.update((function.ops.len() as u32).to_le_bytes());
            hasher.update(bytemuck::cast_slice::<u32, u8>(&function.ops));
        }
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }

    /// Fill in the checksum
    pub fn seal(mut self) -> Self {
        self.checksum = self.compute_checksum();
        self
    }

    pub fn is_intact(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, JitError> {
        serde_json::to_vec(self).map_err(|e| JitError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, JitError> {
        serde_json::from_slice(bytes).map_err(|e| JitError::Serialization(e.to_string()))
    }
}

/// Input of one compile job
pub struct UnitSource<'a> {
    /// Object name the result is stored under
    pub object: &'a str,
    pub module: &'a GuestModule,
    pub functions: Vec<&'a FunctionInfo>,
}

/// What an object is linked against
pub struct LinkContext<'a> {
    pub module: &'a GuestModule,
    pub links: &'a LinkTable,
}

/// Code generator interface
pub trait CodegenBackend: Send + Sync {
    /// Host identity that objects are only valid for
    fn target_cpu(&self) -> String;

    fn compile(&self, unit: &UnitSource<'_>, settings: &CodegenSettings) -> Result<ObjectCode, JitError>;

    fn verify(&self, object: &ObjectCode) -> Result<(), JitError>;

    fn load(&self, object: &ObjectCode, ctx: &LinkContext<'_>) -> Result<Vec<NativeFunction>, JitError>;
}

/// Host entry point an instruction calls out to, if any
fn link_for(op: PpuOpcode) -> Option<LinkEntry> {
    match op {
        PpuOpcode::Sc => Some(LinkEntry::Syscall),
        PpuOpcode::Lwarx => Some(LinkEntry::Lwarx),
        PpuOpcode::Ldarx => Some(LinkEntry::Ldarx),
        PpuOpcode::Stwcx => Some(LinkEntry::Stwcx),
        PpuOpcode::Stdcx => Some(LinkEntry::Stdcx),
        PpuOpcode::Mftb => Some(LinkEntry::GetTb),
        PpuOpcode::Dcbz => Some(LinkEntry::Dcbz),
        PpuOpcode::Unknown => Some(LinkEntry::Trap),
        _ => None,
    }
}

/// Portable backend producing pre-decoded threaded code
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadedBackend;

impl ThreadedBackend {
    pub fn new() -> Self {
        Self
    }

    fn encode_op(
        module: &GuestModule,
        addr: u32,
        word: u32,
        settings: &CodegenSettings,
        symbols: &mut Vec<String>,
    ) -> u32 {
        let op = PpuDecoder::decode(word);
        let mut bits = op.token() as u32;
        if settings.accurate_fma {
            bits |= FUSED_BIT;
        }
        if settings.accurate_cache_line_stores {
            bits |= DCBZ_BIT;
        }
        if op == PpuOpcode::Unknown && settings.precise_interpreter_fallback {
            return bits | FALLBACK_BIT;
        }

        if let PpuOpcode::Lwarx | PpuOpcode::Ldarx = op {
            let width = if op == PpuOpcode::Lwarx { 4 } else { 8 };
            let mode = match settings.reservation_granularity {
                ReservationGranularity::Word => Granularity::Word,
                ReservationGranularity::Line => Granularity::Line,
                ReservationGranularity::Auto => {
                    let following: Vec<u32> = (1..=Granularity::LOOKAHEAD as u32)
                        .map_while(|i| module.word(addr.wrapping_add(i * 4)))
                        .collect();
                    Granularity::scan(&following, width)
                }
            };
            let code = if mode == Granularity::Word { 1 } else { 2 };
            bits |= code << GRANULARITY_SHIFT;
        }

        if let Some(entry) = link_for(op) {
            let index = match symbols.iter().position(|s| s == entry.symbol()) {
                Some(index) => index,
                None => {
                    symbols.push(entry.symbol().to_string());
                    symbols.len() - 1
                }
            };
            bits |= (index as u32 + 1) << SYMBOL_SHIFT;
        }
        bits
    }

    fn decode_op(bits: u32, word: u32, symbols: &[LinkEntry], settings: u16) -> Result<ThreadedOp, String> {
        if bits & RELOCATED_BIT != 0 {
            // Relocated words carry the settings of the whole object.
            let op = PpuDecoder::decode(word);
            let hints = ExecHints {
                fused_fma: settings & 1 != 0,
                accurate_dcbz: settings & 2 != 0,
                granularity: ReservationGranularity::Line,
            };
            let step = match link_for(op) {
                Some(entry) => Step::Link(entry),
                None => Step::Exec(op),
            };
            return Ok(ThreadedOp { step, word, hints });
        }

        let op = PpuOpcode::from_token((bits & TOKEN_MASK) as u16)
            .ok_or_else(|| format!("invalid opcode token {}", bits & TOKEN_MASK))?;
        let hints = ExecHints {
            fused_fma: bits & FUSED_BIT != 0,
            accurate_dcbz: bits & DCBZ_BIT != 0,
            granularity: match (bits >> GRANULARITY_SHIFT) & GRANULARITY_MASK {
                1 => ReservationGranularity::Word,
                _ => ReservationGranularity::Line,
            },
        };
        let step = if bits & FALLBACK_BIT != 0 {
            Step::Fallback
        } else {
            match (bits >> SYMBOL_SHIFT) & SYMBOL_MASK {
                0 => Step::Exec(op),
                index => Step::Link(
                    *symbols
                        .get(index as usize - 1)
                        .ok_or_else(|| format!("symbol index {} out of range", index))?,
                ),
            }
        };
        Ok(ThreadedOp { step, word, hints })
    }
}

impl CodegenBackend for ThreadedBackend {
    fn target_cpu(&self) -> String {
        format!("threaded-{}", std::env::consts::ARCH)
    }

    fn compile(&self, unit: &UnitSource<'_>, settings: &CodegenSettings) -> Result<ObjectCode, JitError> {
        let module = unit.module;
        let backend_error = |reason: String| JitError::Backend {
            chunk: unit.object.to_string(),
            reason,
        };

        let mut symbols = Vec::new();
        let mut functions = Vec::with_capacity(unit.functions.len());
        for function in &unit.functions {
            let (segment, base) = module
                .segment_of(function.addr, function.size)
                .map(|(i, s)| (i, s.addr))
                .ok_or_else(|| backend_error(format!("function 0x{:08x} is outside every segment", function.addr)))?;

            let mut ops = Vec::with_capacity(function.size as usize / 4);
            for addr in (function.addr..function.addr + function.size).step_by(4) {
                if covering(module, addr, 4).next().is_some() {
                    ops.push(RELOCATED_BIT);
                    continue;
                }
                let word = module
                    .word(addr)
                    .ok_or_else(|| backend_error(format!("no code at 0x{:08x}", addr)))?;
                ops.push(Self::encode_op(module, addr, word, settings, &mut symbols));
            }
            functions.push(ObjectFunction {
                segment: segment as u16,
                offset: function.addr - base,
                ops,
            });
        }

        if symbols.len() > SYMBOL_MASK as usize {
            return Err(backend_error(format!("{} link symbols", symbols.len())));
        }

        Ok(ObjectCode {
            name: unit.object.to_string(),
            format: FORMAT,
            cpu: self.target_cpu(),
            settings: settings.encode(),
            symbols,
            functions,
            checksum: String::new(),
        }
        .seal())
    }

    fn verify(&self, object: &ObjectCode) -> Result<(), JitError> {
        let failure = |function: u32, reason: String| JitError::Verification {
            chunk: object.name.clone(),
            function,
            reason,
        };
        if object.format != FORMAT {
            return Err(failure(0, format!("format {} is not {}", object.format, FORMAT)));
        }
        if object.cpu != self.target_cpu() {
            return Err(failure(0, format!("built for {}", object.cpu)));
        }
        if !object.is_intact() {
            return Err(failure(0, "checksum mismatch".to_string()));
        }
        for function in &object.functions {
            if function.ops.is_empty() {
                return Err(failure(function.offset, "empty function".to_string()));
            }
            for &bits in &function.ops {
                if bits & RELOCATED_BIT != 0 {
                    continue;
                }
                if PpuOpcode::from_token((bits & TOKEN_MASK) as u16).is_none() {
                    return Err(failure(function.offset, format!("invalid op 0x{:08x}", bits)));
                }
                let symbol = (bits >> SYMBOL_SHIFT) & SYMBOL_MASK;
                if symbol as usize > object.symbols.len() {
                    return Err(failure(function.offset, format!("symbol index {} out of range", symbol)));
                }
            }
        }
        Ok(())
    }

    fn load(&self, object: &ObjectCode, ctx: &LinkContext<'_>) -> Result<Vec<NativeFunction>, JitError> {
        let backend_error = |reason: String| JitError::Backend {
            chunk: object.name.clone(),
            reason,
        };
        let symbols = object
            .symbols
            .iter()
            .map(|name| {
                ctx.links
                    .resolve(name)
                    .ok_or_else(|| backend_error(format!("unresolved symbol {}", name)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut loaded = Vec::with_capacity(object.functions.len());
        for function in &object.functions {
            let segment = ctx
                .module
                .segments
                .get(function.segment as usize)
                .ok_or_else(|| backend_error(format!("no segment {}", function.segment)))?;
            let addr = segment.addr + function.offset;

            let mut ops = Vec::with_capacity(function.ops.len());
            for (i, &bits) in function.ops.iter().enumerate() {
                let pc = addr + i as u32 * 4;
                let word = ctx
                    .module
                    .word(pc)
                    .ok_or_else(|| backend_error(format!("no code at 0x{:08x}", pc)))?;
                ops.push(Self::decode_op(bits, word, &symbols, object.settings).map_err(backend_error)?);
            }

            loaded.push(NativeFunction {
                addr,
                size: function.size(),
                code: Box::new(ThreadedFunction {
                    addr,
                    ops: ops.into_boxed_slice(),
                }),
            });
        }
        Ok(loaded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Exec(PpuOpcode),
    Link(LinkEntry),
    Fallback,
}

#[derive(Debug, Clone, Copy)]
struct ThreadedOp {
    step: Step,
    word: u32,
    hints: ExecHints,
}

/// Linked threaded-code function
struct ThreadedFunction {
    addr: u32,
    ops: Box<[ThreadedOp]>,
}

impl ThreadedFunction {
    #[inline]
    fn op_at(&self, pc: u64) -> Option<&ThreadedOp> {
        let offset = pc.checked_sub(self.addr as u64)?;
        if offset % 4 != 0 {
            return None;
        }
        self.ops.get((offset / 4) as usize)
    }
}

impl NativeCode for ThreadedFunction {
    fn run(&self, thread: &mut PpuThread, interp: &PpuInterpreter) -> Result<NativeExit, PpuError> {
        let mut first = true;
        loop {
            let pc = thread.pc();
            let Some(op) = self.op_at(pc) else {
                return Ok(NativeExit::Branch);
            };
            let advance = match op.step {
                Step::Exec(opcode) => interp.execute(thread, opcode, op.word, &op.hints)?,
                Step::Link(entry) => {
                    let advance = interp.call_link(entry, thread, op.word, &op.hints)?;
                    if advance {
                        thread.advance_pc();
                    }
                    if thread.signals.pending() || interp.suspend_pending() {
                        return Ok(NativeExit::Branch);
                    }
                    first = false;
                    continue;
                }
                Step::Fallback if first => return Ok(NativeExit::Fallback),
                Step::Fallback => return Ok(NativeExit::Branch),
            };
            first = false;
            if advance {
                thread.advance_pc();
                continue;
            }
            // Control transfer: stay inside only while nothing is pending,
            // so loops reach the gateway checkpoint under suspension.
            if !thread.signals.load().is_empty()
                || interp.suspend_pending()
                || self.op_at(thread.pc()).is_none()
            {
                return Ok(NativeExit::Branch);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oc_core::config::CpuConfig;
    use oc_memory::{MemoryManager, PageFlags};
    use oc_ppu::module::{Relocation, RelocationKind, Segment};
    use oc_ppu::{ExecTable, GlobalSuspend, NullKernel, ReservationUnit};
    use std::sync::Arc;

    const BASE: u32 = 0x1_0000;

    fn create_module(code: &[u32], relocations: Vec<Relocation>) -> GuestModule {
        let data: Vec<u8> = code.iter().flat_map(|w| w.to_be_bytes()).collect();
        let size = data.len() as u32;
        GuestModule::new(
            "backend",
            BASE,
            vec![Segment { addr: BASE, size, flags: PageFlags::RX, data }],
            vec![FunctionInfo::new(BASE, size)],
            relocations,
        )
    }

    fn create_interpreter(module: &GuestModule) -> (PpuInterpreter, PpuThread) {
        let config = CpuConfig::default();
        let memory = MemoryManager::with_main_memory(0x2_0000).unwrap();
        module.load(&memory).unwrap();
        let suspend = Arc::new(GlobalSuspend::new());
        let interp = PpuInterpreter::new(
            memory.clone(),
            Arc::new(ExecTable::new(0, 0x2_0000)),
            Arc::new(ReservationUnit::new(&config, suspend)),
            Arc::new(NullKernel::new()),
            &config,
        );
        (interp, PpuThread::new(0, memory))
    }

    fn build(module: &GuestModule, settings: &CodegenSettings) -> ObjectCode {
        let unit = UnitSource {
            object: "unit.obj",
            module,
            functions: module.functions.iter().collect(),
        };
        ThreadedBackend.compile(&unit, settings).unwrap()
    }

    fn link(module: &GuestModule, object: &ObjectCode) -> Vec<NativeFunction> {
        let links = LinkTable::new();
        ThreadedBackend.load(object, &LinkContext { module, links: &links }).unwrap()
    }

    #[test]
    fn test_compiled_loop_runs_to_return() {
        let module = create_module(
            &[
                0x3880000A, // li r4, 10
                0x7C8903A6, // mtctr r4
                0x38600000, // li r3, 0
                0x7C632214, // add r3, r3, r4
                0x3884FFFF, // addi r4, r4, -1
                0x4200FFF8, // bdnz -8
                0x4E800020, // blr
            ],
            Vec::new(),
        );
        let object = build(&module, &CodegenSettings::default());
        ThreadedBackend.verify(&object).unwrap();
        let functions = link(&module, &object);

        let (interp, mut thread) = create_interpreter(&module);
        thread.set_pc(BASE as u64);
        thread.regs.lr = 0x4000;
        let exit = functions[0].code.run(&mut thread, &interp).unwrap();
        assert_eq!(exit, NativeExit::Branch);
        assert_eq!(thread.gpr(3), 55);
        assert_eq!(thread.pc(), 0x4000);
    }

    #[test]
    fn test_reservation_sites_get_fixed_granularity() {
        let module = create_module(
            &[
                0x7C602828, // lwarx r3, 0, r5
                0x7C60292D, // stwcx. r3, 0, r5
                0x7C6028A8, // ldarx r3, 0, r5
                0x4E800020, // blr
            ],
            Vec::new(),
        );
        let object = build(&module, &CodegenSettings::default());
        let ops = &object.functions[0].ops;
        assert_eq!((ops[0] >> GRANULARITY_SHIFT) & GRANULARITY_MASK, 1);
        assert_eq!((ops[2] >> GRANULARITY_SHIFT) & GRANULARITY_MASK, 2);
        assert_eq!(object.symbols, vec!["__lwarx", "__stwcx", "__ldarx"]);
    }

    #[test]
    fn test_verify_rejects_tampering() {
        let module = create_module(&[0x38600001, 0x4E800020], Vec::new());
        let mut object = build(&module, &CodegenSettings::default());
        object.functions[0].ops[0] ^= 1;
        match ThreadedBackend.verify(&object) {
            Err(JitError::Verification { chunk, reason, .. }) => {
                assert_eq!(chunk, "unit.obj");
                assert!(reason.contains("checksum"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let mut object = build(&module, &CodegenSettings::default());
        object.cpu = "elsewhere".to_string();
        assert!(ThreadedBackend.verify(&object.seal()).is_err());
    }

    #[test]
    fn test_unresolved_symbol_fails_load() {
        let module = create_module(&[0x44000002, 0x4E800020], Vec::new()); // sc; blr
        let mut object = build(&module, &CodegenSettings::default());
        assert_eq!(object.symbols, vec!["__syscall"]);
        object.symbols[0] = "__missing".to_string();
        let links = LinkTable::new();
        let result = ThreadedBackend.load(&object, &LinkContext { module: &module, links: &links });
        assert!(matches!(result, Err(JitError::Backend { .. })));
    }

    #[test]
    fn test_relocated_word_decoded_at_link() {
        let relocations = vec![Relocation { addr: BASE + 2, kind: RelocationKind::Addr16Lo }];
        let module = create_module(&[0x38600000, 0x4E800020], relocations.clone());
        let object = build(&module, &CodegenSettings::default());
        assert_eq!(object.functions[0].ops[0], RELOCATED_BIT);

        // Same object linked against the relocated image.
        let patched = create_module(&[0x38601234, 0x4E800020], relocations);
        let functions = link(&patched, &object);
        let (interp, mut thread) = create_interpreter(&patched);
        thread.set_pc(BASE as u64);
        thread.regs.lr = 0x4000;
        functions[0].code.run(&mut thread, &interp).unwrap();
        assert_eq!(thread.gpr(3), 0x1234);
    }

    #[test]
    fn test_unknown_word_falls_back_when_precise() {
        let module = create_module(&[0x00000000, 0x4E800020], Vec::new());
        let settings = CodegenSettings {
            precise_interpreter_fallback: true,
            ..CodegenSettings::default()
        };
        let functions = link(&module, &build(&module, &settings));
        let (interp, mut thread) = create_interpreter(&module);
        thread.set_pc(BASE as u64);
        assert_eq!(functions[0].code.run(&mut thread, &interp).unwrap(), NativeExit::Fallback);
        assert_eq!(thread.pc(), BASE as u64);
    }

    #[test]
    fn test_object_bytes_round_trip() {
        let module = create_module(&[0x38600001, 0x4E800020], Vec::new());
        let object = build(&module, &CodegenSettings::default());
        let parsed = ObjectCode::from_bytes(&object.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, object);
        assert!(parsed.is_intact());
        assert!(ObjectCode::from_bytes(b"{not json").is_err());
    }
}
