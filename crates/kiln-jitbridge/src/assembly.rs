//! Code and metadata assembly
//!
//! Owns the method's code/data buffers, the relocation list, exception
//! clauses, frame/unwind records, and the GC-pointer map, and packages
//! them into the artifact the output writer consumes. One buffer instance
//! exists per kind per compilation; relocation sources must land inside a
//! buffer this compilation allocated, and every record is torn down in
//! [`CodeAssembly::reset`] before the next method.

use serde::{Deserialize, Serialize};

use crate::error::CompileError;

/// The buffer kinds a compilation may allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    HotCode,
    ColdCode,
    RoData,
}

/// Backend request for the method's buffers
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferRequest {
    pub hot_size: u32,
    pub cold_size: u32,
    pub rodata_size: u32,
    /// Requested read-only data alignment; 0 means pointer width
    pub rodata_align: u32,
    pub eh_clause_count: u32,
}

/// Stable addresses of the allocated buffers (0 when absent)
#[derive(Debug, Clone, Copy)]
pub struct AllocatedBuffers {
    pub hot: usize,
    pub cold: usize,
    pub rodata: usize,
}

/// Relocation encoding kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelocKind {
    /// 64-bit absolute address
    Abs64,
    /// 32-bit pc-relative displacement
    Rel32,
}

/// Where a relocation points, as recorded in the artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelocTarget {
    /// Inside one of this method's own buffers: block plus offset,
    /// never a handle
    Block { block: BufferKind, offset: u32 },
    /// An external symbol, by output-writer name
    External { symbol: String },
}

/// One relocation: patch location and target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    /// Buffer the patch location lies in
    pub block: BufferKind,
    /// Offset of the patch location within that buffer
    pub offset: u32,
    pub kind: RelocKind,
    pub target: RelocTarget,
}

/// Exception clause kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EhClauseKind {
    /// Catch of a specific type, by output-writer symbol name
    Typed { class_symbol: String },
    /// Filter clause; the filter code starts at this hot-code offset
    Filter { filter_offset: u32 },
    Finally,
    Fault,
}

/// One protected region and its handler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EhClause {
    pub kind: EhClauseKind,
    pub try_offset: u32,
    pub try_len: u32,
    pub handler_offset: u32,
    pub handler_len: u32,
}

/// Which function region a frame record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncRegion {
    /// The method's main body
    Root,
    /// Handler funclet of the clause at this index
    Handler(u32),
    /// Filter funclet of the clause at this index
    Filter(u32),
}

/// Frame/unwind information for one function region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub region: FuncRegion,
    pub unwind: Vec<u8>,
}

/// The packaged result of one successful compilation. Ownership passes
/// to the output writer; the assembly is reset either way.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodArtifact {
    pub method: String,
    pub hot_code: Vec<u8>,
    pub cold_code: Option<Vec<u8>>,
    pub rodata: Option<Vec<u8>>,
    pub rodata_align: u32,
    /// Sorted by (block, source offset)
    pub relocations: Vec<Relocation>,
    pub eh_clauses: Vec<EhClause>,
    pub frames: Vec<FrameRecord>,
    pub gc_map: Vec<u8>,
    /// CRC-32 of the hot code bytes
    pub checksum: u32,
}

/// Per-compilation buffer and metadata state
pub struct CodeAssembly {
    request: Option<BufferRequest>,
    rodata_align: u32,
    hot: Vec<u8>,
    cold: Vec<u8>,
    rodata: Vec<u8>,
    relocations: Vec<Relocation>,
    eh_clauses: Vec<EhClause>,
    frames: Vec<FrameRecord>,
    gc_map: Vec<u8>,
}

impl CodeAssembly {
    pub fn new() -> Self {
        CodeAssembly {
            request: None,
            rodata_align: 0,
            hot: Vec::new(),
            cold: Vec::new(),
            rodata: Vec::new(),
            relocations: Vec::new(),
            eh_clauses: Vec::new(),
            frames: Vec::new(),
            gc_map: Vec::new(),
        }
    }

    /// Allocate the method's buffers.
    ///
    /// # Panics
    ///
    /// Panics on a second allocation in the same compilation, or on an
    /// alignment request outside the supported set — both backend
    /// contract violations.
    pub fn alloc_buffers(
        &mut self,
        req: BufferRequest,
        pointer_size: u32,
        max_align: u32,
    ) -> AllocatedBuffers {
        assert!(
            self.request.is_none(),
            "method buffers were already allocated"
        );
        let align = if req.rodata_align == 0 {
            pointer_size
        } else {
            req.rodata_align
        };
        assert!(
            align.is_power_of_two() && align <= max_align,
            "unsupported read-only data alignment {align}"
        );
        self.rodata_align = align;
        self.hot = vec![0; req.hot_size as usize];
        self.cold = vec![0; req.cold_size as usize];
        self.rodata = vec![0; req.rodata_size as usize];
        self.request = Some(req);
        AllocatedBuffers {
            hot: self.hot.as_ptr() as usize,
            cold: if self.cold.is_empty() {
                0
            } else {
                self.cold.as_ptr() as usize
            },
            rodata: if self.rodata.is_empty() {
                0
            } else {
                self.rodata.as_ptr() as usize
            },
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.request.is_some()
    }

    /// Mutable view of one buffer for the backend to fill
    pub fn buffer_mut(&mut self, kind: BufferKind) -> &mut [u8] {
        match kind {
            BufferKind::HotCode => &mut self.hot,
            BufferKind::ColdCode => &mut self.cold,
            BufferKind::RoData => &mut self.rodata,
        }
    }

    /// The buffer containing `addr`, with the offset into it
    pub fn classify_address(&self, addr: usize) -> Option<(BufferKind, u32)> {
        let ranges = [
            (BufferKind::HotCode, &self.hot),
            (BufferKind::ColdCode, &self.cold),
            (BufferKind::RoData, &self.rodata),
        ];
        for (kind, buf) in ranges {
            if buf.is_empty() {
                continue;
            }
            let base = buf.as_ptr() as usize;
            if addr >= base && addr < base + buf.len() {
                return Some((kind, (addr - base) as u32));
            }
        }
        None
    }

    /// Record one relocation. The caller has already resolved the target;
    /// the source address must lie inside one of this method's buffers.
    ///
    /// # Panics
    ///
    /// Panics when the source address is outside every allocated buffer —
    /// a backend contract violation.
    pub fn record_relocation(&mut self, at: usize, kind: RelocKind, target: RelocTarget) {
        let (block, offset) = self
            .classify_address(at)
            .unwrap_or_else(|| panic!("relocation source {at:#x} outside method buffers"));
        self.relocations.push(Relocation {
            block,
            offset,
            kind,
            target,
        });
    }

    /// Install the finalized exception clauses.
    ///
    /// # Panics
    ///
    /// Panics when the count differs from the buffer request.
    pub fn set_eh_clauses(&mut self, clauses: Vec<EhClause>) {
        let expected = self.request.map(|r| r.eh_clause_count).unwrap_or(0);
        assert!(
            clauses.len() as u32 == expected,
            "expected {expected} exception clauses, got {}",
            clauses.len()
        );
        self.eh_clauses = clauses;
    }

    /// Append frame/unwind info for one function region
    pub fn add_frame_info(&mut self, region: FuncRegion, unwind: Vec<u8>) {
        self.frames.push(FrameRecord { region, unwind });
    }

    /// Install the finalized GC-pointer map
    pub fn set_gc_map(&mut self, map: Vec<u8>) {
        self.gc_map = map;
    }

    /// Package the compilation into an artifact. Relocations are sorted
    /// by source offset; the hot code is checksummed.
    pub fn finish(&mut self, method: String) -> Result<MethodArtifact, CompileError> {
        if self.request.is_none() {
            return Err(CompileError::CodeGenFailed {
                method,
                reason: "backend completed without allocating code buffers".to_string(),
            });
        }
        self.relocations
            .sort_by_key(|r| (r.block, r.offset));
        let hot_code = std::mem::take(&mut self.hot);
        let checksum = crc32fast::hash(&hot_code);
        let cold = std::mem::take(&mut self.cold);
        let rodata = std::mem::take(&mut self.rodata);
        let artifact = MethodArtifact {
            method,
            hot_code,
            cold_code: if cold.is_empty() { None } else { Some(cold) },
            rodata: if rodata.is_empty() { None } else { Some(rodata) },
            rodata_align: self.rodata_align,
            relocations: std::mem::take(&mut self.relocations),
            eh_clauses: std::mem::take(&mut self.eh_clauses),
            frames: std::mem::take(&mut self.frames),
            gc_map: std::mem::take(&mut self.gc_map),
            checksum,
        };
        self.request = None;
        self.rodata_align = 0;
        Ok(artifact)
    }

    /// Discard all buffers and records, ready for the next compilation
    pub fn reset(&mut self) {
        self.request = None;
        self.rodata_align = 0;
        self.hot.clear();
        self.cold.clear();
        self.rodata.clear();
        self.relocations.clear();
        self.eh_clauses.clear();
        self.frames.clear();
        self.gc_map.clear();
    }
}

impl Default for CodeAssembly {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(hot: u32) -> BufferRequest {
        BufferRequest {
            hot_size: hot,
            ..BufferRequest::default()
        }
    }

    #[test]
    fn test_alloc_and_write() {
        let mut asm = CodeAssembly::new();
        let addrs = asm.alloc_buffers(request(16), 8, 16);
        assert_ne!(addrs.hot, 0);
        assert_eq!(addrs.cold, 0);

        asm.buffer_mut(BufferKind::HotCode)[0] = 0xCC;
        let artifact = asm.finish("Widget.Draw".to_string()).unwrap();
        assert_eq!(artifact.hot_code.len(), 16);
        assert_eq!(artifact.hot_code[0], 0xCC);
        assert_eq!(artifact.checksum, crc32fast::hash(&artifact.hot_code));
        assert!(artifact.cold_code.is_none());
    }

    #[test]
    #[should_panic(expected = "already allocated")]
    fn test_double_alloc_panics() {
        let mut asm = CodeAssembly::new();
        asm.alloc_buffers(request(16), 8, 16);
        asm.alloc_buffers(request(16), 8, 16);
    }

    #[test]
    #[should_panic(expected = "unsupported read-only data alignment")]
    fn test_oversized_alignment_panics() {
        let mut asm = CodeAssembly::new();
        asm.alloc_buffers(
            BufferRequest {
                hot_size: 8,
                rodata_size: 8,
                rodata_align: 64,
                ..BufferRequest::default()
            },
            8,
            16,
        );
    }

    #[test]
    fn test_relocation_classification_and_sorting() {
        let mut asm = CodeAssembly::new();
        let addrs = asm.alloc_buffers(
            BufferRequest {
                hot_size: 32,
                rodata_size: 16,
                rodata_align: 8,
                ..BufferRequest::default()
            },
            8,
            16,
        );

        // Record out of order; target of the first lies in our own rodata
        asm.record_relocation(
            addrs.hot + 12,
            RelocKind::Rel32,
            RelocTarget::Block {
                block: BufferKind::RoData,
                offset: 8,
            },
        );
        asm.record_relocation(
            addrs.hot + 4,
            RelocKind::Rel32,
            RelocTarget::External {
                symbol: "helper:kiln_new_object".to_string(),
            },
        );

        let artifact = asm.finish("m".to_string()).unwrap();
        assert_eq!(artifact.relocations.len(), 2);
        assert_eq!(artifact.relocations[0].offset, 4);
        assert_eq!(artifact.relocations[1].offset, 12);
        // Containment property: every source offset is inside its buffer
        for r in &artifact.relocations {
            assert!(r.offset < 32);
        }
    }

    #[test]
    #[should_panic(expected = "outside method buffers")]
    fn test_relocation_outside_buffers_panics() {
        let mut asm = CodeAssembly::new();
        asm.alloc_buffers(request(16), 8, 16);
        asm.record_relocation(
            0xdead_0000,
            RelocKind::Abs64,
            RelocTarget::External {
                symbol: "x".to_string(),
            },
        );
    }

    #[test]
    #[should_panic(expected = "expected 2 exception clauses")]
    fn test_eh_clause_count_mismatch_panics() {
        let mut asm = CodeAssembly::new();
        asm.alloc_buffers(
            BufferRequest {
                hot_size: 8,
                eh_clause_count: 2,
                ..BufferRequest::default()
            },
            8,
            16,
        );
        asm.set_eh_clauses(vec![EhClause {
            kind: EhClauseKind::Finally,
            try_offset: 0,
            try_len: 4,
            handler_offset: 4,
            handler_len: 4,
        }]);
    }

    #[test]
    fn test_finish_without_alloc_fails() {
        let mut asm = CodeAssembly::new();
        let err = asm.finish("m".to_string()).unwrap_err();
        assert!(matches!(err, CompileError::CodeGenFailed { .. }));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut asm = CodeAssembly::new();
        let addrs = asm.alloc_buffers(request(8), 8, 16);
        asm.record_relocation(
            addrs.hot,
            RelocKind::Abs64,
            RelocTarget::External {
                symbol: "x".to_string(),
            },
        );
        asm.add_frame_info(FuncRegion::Root, vec![1, 2]);
        asm.set_gc_map(vec![0, 1]);
        asm.reset();

        assert!(!asm.is_allocated());
        // A fresh compilation can allocate again
        asm.alloc_buffers(request(8), 8, 16);
        let artifact = asm.finish("m".to_string()).unwrap();
        assert!(artifact.relocations.is_empty());
        assert!(artifact.frames.is_empty());
        assert!(artifact.gc_map.is_empty());
    }

    #[test]
    fn test_artifact_serialization_roundtrip() {
        let mut asm = CodeAssembly::new();
        let addrs = asm.alloc_buffers(request(8), 8, 16);
        asm.record_relocation(
            addrs.hot,
            RelocKind::Abs64,
            RelocTarget::External {
                symbol: "method:Widget.Draw".to_string(),
            },
        );
        asm.add_frame_info(FuncRegion::Root, vec![0x10]);
        let artifact = asm.finish("Widget.Caller".to_string()).unwrap();

        let json = serde_json::to_string(&artifact).unwrap();
        let back: MethodArtifact = serde_json::from_str(&json).unwrap();
        assert_eq!(artifact, back);
    }
}
