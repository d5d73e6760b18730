//! Chunk partitioning and content hashing

use oc_ppu::module::{GuestModule, Relocation};
use sha1::{Digest, Sha1};

use crate::settings::CodegenSettings;

/// Object file format version, part of every object name
pub const FORMAT: u32 = 1;

/// Widest relocated field, in bytes
const MAX_RELOC_SIZE: u32 = 8;

/// Functions compiled together into one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationUnit {
    /// Indices into the module's function list, in address order
    pub functions: Vec<usize>,
    pub hash: String,
    pub settings: u16,
    pub object: String,
}

impl CompilationUnit {
    pub fn new(module: &GuestModule, functions: Vec<usize>, settings: &CodegenSettings, cpu: &str) -> Self {
        let settings = settings.encode();
        let hash = unit_hash(module, &functions, settings);
        let object = object_name(&hash, settings, cpu);
        Self {
            functions,
            hash,
            settings,
            object,
        }
    }

    /// Code bytes covered by the unit
    pub fn size(&self, module: &GuestModule) -> u64 {
        self.functions.iter().map(|&i| module.functions[i].size as u64).sum()
    }
}

pub fn object_name(hash: &str, settings: u16, cpu: &str) -> String {
    format!("v{}-{}-{:04x}-{}.obj", FORMAT, hash, settings, cpu)
}

/// Split the module's functions into address-ordered chunks
///
/// A function larger than `max_bytes` gets a chunk of its own.
pub fn partition(module: &GuestModule, max_bytes: u32, max_functions: usize) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..module.functions.len()).collect();
    order.sort_by_key(|&i| module.functions[i].addr);

    let mut chunks = Vec::new();
    let mut current = Vec::new();
    let mut bytes = 0u64;
    for index in order {
        let size = module.functions[index].size as u64;
        if !current.is_empty() && (bytes + size > max_bytes as u64 || current.len() >= max_functions.max(1)) {
            chunks.push(std::mem::take(&mut current));
            bytes = 0;
        }
        current.push(index);
        bytes += size;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Relocations overlapping `addr..addr+len`
pub(crate) fn covering(module: &GuestModule, addr: u32, len: u32) -> impl Iterator<Item = &Relocation> {
    let start = addr.saturating_sub(MAX_RELOC_SIZE - 1);
    let end = addr as u64 + len as u64;
    module
        .relocations_in(start, len + (addr - start))
        .iter()
        .filter(move |r| r.addr as u64 + r.size() as u64 > addr as u64 && (r.addr as u64) < end)
}

/// Image bytes of `addr..addr+len`, zero-filled past the segment data
fn image_bytes(module: &GuestModule, addr: u32, len: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(len as usize + 4);
    let mut word_addr = addr & !3;
    while (word_addr as u64) < addr as u64 + len as u64 {
        bytes.extend_from_slice(&module.word(word_addr).unwrap_or(0).to_be_bytes());
        word_addr += 4;
    }
    let skip = (addr - (addr & !3)) as usize;
    bytes.drain(..skip);
    bytes.truncate(len as usize);
    bytes
}

/// Content hash of a chunk
///
/// Covers the segment-relative placement of every function, the bytes of
/// every block with relocated fields zeroed and their kinds hashed instead,
/// and the settings encoding.
pub fn unit_hash(module: &GuestModule, functions: &[usize], settings: u16) -> String {
    let mut hasher = Sha1::new();
    for &index in functions {
        let function = &module.functions[index];
        let (segment, base) = module
            .segment_of(function.addr, function.size)
            .map(|(i, s)| (i as u16, s.addr))
            .unwrap_or((u16::MAX, 0));
        hasher.update(segment.to_le_bytes());
        hasher.update(function.addr.wrapping_sub(base).to_le_bytes());
        hasher.update(function.size.to_le_bytes());

        for block in &function.blocks {
            hasher.update(block.addr.wrapping_sub(function.addr).to_le_bytes());
            hasher.update(block.size.to_le_bytes());
            let mut bytes = image_bytes(module, block.addr, block.size);
            for reloc in covering(module, block.addr, block.size) {
                let from = reloc.addr.saturating_sub(block.addr) as usize;
                let to = ((reloc.addr as u64 + reloc.size() as u64 - block.addr as u64) as usize).min(bytes.len());
                bytes[from..to].fill(0);
                hasher.update([reloc.kind as u8]);
                hasher.update(reloc.addr.wrapping_sub(block.addr).to_le_bytes());
            }
            hasher.update(&bytes);
        }
    }
    hasher.update(settings.to_le_bytes());
    hex(&hasher.finalize())
}

/// Identity of one load of a module
///
/// Two loads match only when they sit at the same addresses and split into
/// the same objects, so a rebuilt image under an old name does not.
pub fn module_fingerprint(module: &GuestModule, units: &[CompilationUnit]) -> String {
    let mut hasher = Sha1::new();
    for segment in &module.segments {
        hasher.update(segment.addr.to_le_bytes());
        hasher.update(segment.size.to_le_bytes());
    }
    for unit in units {
        hasher.update(unit.object.as_bytes());
    }
    hex(&hasher.finalize())
}

fn hex(digest: &[u8]) -> String {
    digest.iter().map(|byte| format!("{:02x}", byte)).collect()
}
