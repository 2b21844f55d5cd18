//! In-memory fakes of the DMA allocator and the processor, shared by the unit
//! tests and, through the `testing` feature, the integration suites.

use crate::config::{PAGE_SHIFT, PAGE_SIZE};
use crate::error::TraceError;
use crate::platform::{Bti, DmaBuffer, PhysicalAddress, RawHandle, Rights};
use alloc::rc::Rc;
use alloc::vec;
use alloc::vec::Vec;
use core::cell::RefCell;
use kernel_cpuid::{CpuidResult, CpuidSource};

#[derive(Debug, Copy, Clone)]
pub struct Allocation {
    pub pa: PhysicalAddress,
    pub size: u64,
    pub alignment_log2: u32,
}

/// Bookkeeping shared by a [`FakeBti`] and every buffer it handed out.
#[derive(Debug, Default)]
pub struct Memory {
    /// Every allocation in order, freed or not.
    pub allocations: Vec<Allocation>,
    /// Buffers allocated and not yet dropped.
    pub live: usize,
    /// Handles handed out by [`DmaBuffer::duplicate`].
    pub exported: Vec<(PhysicalAddress, Rights)>,
    /// Remaining successful allocations before `NoMemory`.
    pub fail_after: Option<usize>,
}

/// Bump allocator over a fake physical address space.
pub struct FakeBti {
    next: u64,
    misalign: bool,
    pub memory: Rc<RefCell<Memory>>,
}

impl Default for FakeBti {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBti {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: 0x4000_0000,
            misalign: false,
            memory: Rc::default(),
        }
    }

    /// Succeed `n` more times, then report out of memory.
    #[must_use]
    pub fn fail_after(self, n: usize) -> Self {
        self.memory.borrow_mut().fail_after = Some(n);
        self
    }

    /// Hand out regions that are page aligned but not self aligned.
    #[must_use]
    pub const fn misalign(mut self) -> Self {
        self.misalign = true;
        self
    }

    /// Buffers allocated and not yet dropped.
    #[must_use]
    pub fn live(&self) -> usize {
        self.memory.borrow().live
    }
}

impl Bti for FakeBti {
    type Buffer = FakeBuffer;

    fn alloc_contiguous(&mut self, size: u64, alignment_log2: u32) -> Result<FakeBuffer, TraceError> {
        let mut memory = self.memory.borrow_mut();
        if let Some(n) = &mut memory.fail_after {
            if *n == 0 {
                return Err(TraceError::NoMemory);
            }
            *n -= 1;
        }
        let len = usize::try_from(size).map_err(|_| TraceError::NoMemory)?;

        let mut pa = self.next.next_multiple_of(1 << alignment_log2);
        if self.misalign && alignment_log2 > PAGE_SHIFT {
            pa += PAGE_SIZE;
        }
        self.next = pa + size;

        let pa = PhysicalAddress::new(pa);
        memory.allocations.push(Allocation {
            pa,
            size,
            alignment_log2,
        });
        memory.live += 1;

        Ok(FakeBuffer {
            pa,
            data: vec![0; len],
            memory: Rc::clone(&self.memory),
        })
    }
}

pub struct FakeBuffer {
    pa: PhysicalAddress,
    data: Vec<u8>,
    memory: Rc<RefCell<Memory>>,
}

impl DmaBuffer for FakeBuffer {
    fn phys(&self) -> PhysicalAddress {
        self.pa
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn rights(&self) -> Rights {
        Rights::from_bits(0xFFFF)
    }

    fn duplicate(&self, rights: Rights) -> Result<RawHandle, TraceError> {
        let mut memory = self.memory.borrow_mut();
        memory.exported.push((self.pa, rights));
        let count = u32::try_from(memory.exported.len()).map_err(|_| TraceError::NoResources)?;
        Ok(0x100 + count)
    }
}

impl Drop for FakeBuffer {
    fn drop(&mut self) {
        self.memory.borrow_mut().live -= 1;
    }
}

/// Canned CPUID answers for the leaves the prober reads.
#[derive(Clone)]
pub struct FakeCpu {
    pub max_basic: u32,
    pub leaf1_eax: u32,
    pub leaf7_ebx: u32,
    pub leaf14: [CpuidResult; 2],
    pub leaf15: CpuidResult,
}

impl FakeCpu {
    /// A Kaby Lake class part with every optional feature, multi-entry ToPA
    /// and two address ranges.
    #[must_use]
    pub const fn full() -> Self {
        Self {
            max_basic: 0x16,
            leaf1_eax: 0x0008_06E9,
            leaf7_ebx: 1 << 25,
            leaf14: [
                CpuidResult {
                    eax: 1,
                    ebx: 0x3F,
                    ecx: 0x8000_0007,
                    edx: 0,
                },
                CpuidResult {
                    eax: 0x0249_0002,
                    ebx: 0x003F_3FFF,
                    ecx: 0,
                    edx: 0,
                },
            ],
            leaf15: CpuidResult {
                eax: 2,
                ebx: 168,
                ecx: 0,
                edx: 0,
            },
        }
    }

    /// ToPA output with a single entry per table and nothing else.
    #[must_use]
    pub const fn minimal() -> Self {
        Self {
            max_basic: 0x14,
            leaf1_eax: 0x0004_06C4,
            leaf7_ebx: 1 << 25,
            leaf14: [
                CpuidResult {
                    eax: 0,
                    ebx: 0,
                    ecx: 1,
                    edx: 0,
                },
                CpuidResult {
                    eax: 0,
                    ebx: 0,
                    ecx: 0,
                    edx: 0,
                },
            ],
            leaf15: CpuidResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            },
        }
    }

    /// No processor trace at all.
    #[must_use]
    pub const fn without_pt() -> Self {
        Self {
            leaf7_ebx: 0,
            ..Self::full()
        }
    }

    #[must_use]
    pub const fn without_ptwrite(mut self) -> Self {
        self.leaf14[0].ebx &= !(1 << 4);
        self
    }
}

impl CpuidSource for FakeCpu {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        match leaf {
            0x00 => CpuidResult {
                eax: self.max_basic,
                ebx: u32::from_le_bytes(*b"Genu"),
                edx: u32::from_le_bytes(*b"ineI"),
                ecx: u32::from_le_bytes(*b"ntel"),
            },
            0x01 => CpuidResult {
                eax: self.leaf1_eax,
                ..CpuidResult::default()
            },
            0x07 => CpuidResult {
                ebx: self.leaf7_ebx,
                ..CpuidResult::default()
            },
            0x14 if subleaf < 2 => self.leaf14[subleaf as usize],
            0x15 => self.leaf15,
            _ => CpuidResult::default(),
        }
    }
}
