//! Guest module images
//!
//! A [`GuestModule`] is what a loader hands to the execution core: loadable
//! segments, the functions found in them and the relocations applied to them.

use oc_core::error::{JitError, MemoryError};
use oc_memory::constants::PAGE_SIZE;
use oc_memory::{MemoryManager, PageFlags};

/// Loadable segment
#[derive(Debug, Clone)]
pub struct Segment {
    pub addr: u32,
    pub size: u32,
    pub flags: PageFlags,
    /// File contents; the tail past `data.len()` is zero-filled
    pub data: Vec<u8>,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.addr as u64 + self.size as u64
    }

    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.addr && addr as u64 + len as u64 <= self.end()
    }
}

/// Basic block inside a function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub addr: u32,
    pub size: u32,
}

/// Function discovered in a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub addr: u32,
    pub size: u32,
    pub blocks: Vec<BlockInfo>,
}

impl FunctionInfo {
    /// Function made of a single block
    pub fn new(addr: u32, size: u32) -> Self {
        Self {
            addr,
            size,
            blocks: vec![BlockInfo { addr, size }],
        }
    }
}

/// PowerPC relocation types a loader may leave in code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RelocationKind {
    Addr32 = 1,
    Addr16Lo = 4,
    Addr16Hi = 5,
    Addr16Ha = 6,
    Rel24 = 10,
    Addr64 = 38,
}

impl RelocationKind {
    /// Bytes the relocated field occupies
    pub fn size(self) -> u32 {
        match self {
            RelocationKind::Addr16Lo | RelocationKind::Addr16Hi | RelocationKind::Addr16Ha => 2,
            RelocationKind::Addr32 | RelocationKind::Rel24 => 4,
            RelocationKind::Addr64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub addr: u32,
    pub kind: RelocationKind,
}

impl Relocation {
    pub fn size(&self) -> u32 {
        self.kind.size()
    }
}

/// Module image ready to load and compile
#[derive(Debug, Clone)]
pub struct GuestModule {
    pub name: String,
    pub entry: u32,
    pub segments: Vec<Segment>,
    pub functions: Vec<FunctionInfo>,
    /// Sorted by address
    pub relocations: Vec<Relocation>,
}

impl GuestModule {
    pub fn new(
        name: impl Into<String>,
        entry: u32,
        segments: Vec<Segment>,
        functions: Vec<FunctionInfo>,
        mut relocations: Vec<Relocation>,
    ) -> Self {
        relocations.sort_by_key(|reloc| reloc.addr);
        Self {
            name: name.into(),
            entry,
            segments,
            functions,
            relocations,
        }
    }

    /// Module holding one executable segment treated as a single function
    pub fn from_flat_image(name: impl Into<String>, base: u32, data: Vec<u8>) -> Self {
        let size = (data.len() as u32 + 3) & !3;
        Self::new(
            name,
            base,
            vec![Segment { addr: base, size, flags: PageFlags::RX, data }],
            vec![FunctionInfo::new(base, size)],
            Vec::new(),
        )
    }

    /// Index and segment holding `addr..addr+len`
    pub fn segment_of(&self, addr: u32, len: u32) -> Option<(usize, &Segment)> {
        self.segments
            .iter()
            .enumerate()
            .find(|(_, segment)| segment.contains(addr, len))
    }

    /// Image bytes at `addr`, zero-fill past the segment's file data excluded
    pub fn bytes(&self, addr: u32, len: u32) -> Option<&[u8]> {
        let (_, segment) = self.segment_of(addr, len)?;
        let start = (addr - segment.addr) as usize;
        segment.data.get(start..start + len as usize)
    }

    /// Big-endian word at `addr`; zero in the zero-filled tail
    pub fn word(&self, addr: u32) -> Option<u32> {
        let (_, segment) = self.segment_of(addr, 4)?;
        let start = (addr - segment.addr) as usize;
        let mut word = [0u8; 4];
        for (i, byte) in word.iter_mut().enumerate() {
            *byte = segment.data.get(start + i).copied().unwrap_or(0);
        }
        Some(u32::from_be_bytes(word))
    }

    /// Total bytes of code across all functions
    pub fn code_size(&self) -> u64 {
        self.functions.iter().map(|f| f.size as u64).sum()
    }

    /// Relocations whose first byte lies in `addr..addr+len`
    pub fn relocations_in(&self, addr: u32, len: u32) -> &[Relocation] {
        let end = addr as u64 + len as u64;
        let start = self.relocations.partition_point(|r| r.addr < addr);
        let stop = self.relocations.partition_point(|r| (r.addr as u64) < end);
        &self.relocations[start..stop.max(start)]
    }

    /// Check that functions, blocks and relocations lie inside segments
    pub fn validate(&self) -> Result<(), JitError> {
        let malformed = |reason: String| JitError::MalformedModule {
            module: self.name.clone(),
            reason,
        };
        for segment in &self.segments {
            if segment.data.len() as u64 > segment.size as u64 {
                return Err(malformed(format!(
                    "segment 0x{:08x} holds more data than its size",
                    segment.addr
                )));
            }
        }
        for function in &self.functions {
            if function.addr % 4 != 0 || function.size == 0 || function.size % 4 != 0 {
                return Err(malformed(format!("function 0x{:08x} is misaligned", function.addr)));
            }
            let Some((index, _)) = self.segment_of(function.addr, function.size) else {
                return Err(malformed(format!(
                    "function 0x{:08x}+0x{:x} lies outside every segment",
                    function.addr, function.size
                )));
            };
            let segment = &self.segments[index];
            if !segment.flags.contains(PageFlags::EXECUTE) {
                return Err(malformed(format!(
                    "function 0x{:08x} is in a non-executable segment",
                    function.addr
                )));
            }
            let end = function.addr as u64 + function.size as u64;
            for block in &function.blocks {
                if block.addr < function.addr || block.addr as u64 + block.size as u64 > end {
                    return Err(malformed(format!(
                        "block 0x{:08x} escapes function 0x{:08x}",
                        block.addr, function.addr
                    )));
                }
            }
        }
        for reloc in &self.relocations {
            if self.segment_of(reloc.addr, reloc.size()).is_none() {
                return Err(malformed(format!("relocation at 0x{:08x} lies outside every segment", reloc.addr)));
            }
        }
        Ok(())
    }

    /// Copy every segment into guest memory, mapping it when needed
    pub fn load(&self, memory: &MemoryManager) -> Result<(), MemoryError> {
        for segment in &self.segments {
            if memory.region(segment.addr, segment.size).is_err() {
                let size = (segment.size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                memory.map(segment.addr, size, segment.flags)?;
            }
            let mut image = segment.data.clone();
            image.resize(segment.size as usize, 0);
            memory.load_image(segment.addr, &image)?;
            tracing::debug!(
                target: "ppu",
                "loaded segment 0x{:08x}+0x{:x} of {}",
                segment.addr,
                segment.size,
                self.name
            );
        }
        Ok(())
    }
}
