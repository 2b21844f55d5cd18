//! Fakes of the host kernel shared by the integration suites. The allocator
//! and processor fakes come from `insntrace::testing`.

#![allow(dead_code)]

use insntrace::testing::Memory;
use insntrace::{
    BufferConfig, BufferInfo, ChunkHandleRequest, DriverConfig, InsntraceAction, InsntraceDevice, MtracePayload, Op,
    PlatformDevice, PtRegs, RawHandle, SystemCalls, TraceConfig, TraceError, TraceMode, Wire, probe,
};
use kernel_registers::Ia32RtitCtl;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

pub use insntrace::testing::{FakeBti, FakeBuffer, FakeCpu};

pub const PAGE: u64 = 4096;

/// What the fake trace hardware saw and will report.
#[derive(Default)]
pub struct Kernel {
    pub calls: Vec<(InsntraceAction, u32)>,
    pub trace_config: Option<TraceConfig>,
    /// Register values staged per CPU.
    pub staged: BTreeMap<u32, PtRegs>,
    pub closed: Vec<RawHandle>,
    /// The next call with this action fails with this error.
    pub fail: Option<(InsntraceAction, TraceError)>,
    /// `IA32_RTIT_OUTPUT_MASK_PTRS` reported on retrieval.
    pub write_position: u64,
    /// `IA32_RTIT_OUTPUT_BASE` reported on retrieval; the staged value if unset.
    pub output_base: Option<u64>,
    /// `IA32_RTIT_STATUS` reported on retrieval.
    pub status: u64,
}

pub struct FakeSys {
    cpus: u32,
    pub kernel: Rc<RefCell<Kernel>>,
}

impl FakeSys {
    pub fn new(cpus: u32) -> Self {
        Self {
            cpus,
            kernel: Rc::default(),
        }
    }
}

impl SystemCalls for FakeSys {
    fn num_cpus(&self) -> u32 {
        self.cpus
    }

    fn mtrace_control(
        &mut self,
        action: InsntraceAction,
        options: u32,
        payload: MtracePayload<'_>,
    ) -> Result<(), TraceError> {
        let mut k = self.kernel.borrow_mut();
        if let Some((a, e)) = k.fail
            && a == action
        {
            k.fail = None;
            return Err(e);
        }
        k.calls.push((action, options));

        match (action, payload) {
            (InsntraceAction::AllocTrace, MtracePayload::TraceConfig(config)) => k.trace_config = Some(*config),
            (InsntraceAction::FreeTrace, MtracePayload::None) => k.trace_config = None,
            (InsntraceAction::StageTraceData, MtracePayload::Regs(regs)) => {
                k.staged.insert(options, *regs);
            }
            (InsntraceAction::GetTraceData, MtracePayload::Regs(regs)) => {
                let staged = k.staged.get(&options).copied().ok_or(TraceError::BadState)?;
                *regs = PtRegs {
                    ctl: staged.ctl & !Ia32RtitCtl::TRACE_EN,
                    status: k.status,
                    output_base: k.output_base.unwrap_or(staged.output_base),
                    output_mask_ptrs: k.write_position,
                    ..staged
                };
            }
            (InsntraceAction::Start | InsntraceAction::Stop, MtracePayload::None) => {}
            (action, payload) => panic!("unexpected payload for {action:?}: {payload:?}"),
        }
        Ok(())
    }

    fn handle_close(&mut self, handle: RawHandle) {
        self.kernel.borrow_mut().closed.push(handle);
    }
}

/// A platform device with at most one BTI.
pub struct FakePlatform {
    pub bti: Option<FakeBti>,
}

impl PlatformDevice for FakePlatform {
    type Bti = FakeBti;

    fn get_bti(&mut self, index: u32) -> Result<FakeBti, TraceError> {
        if index != 0 {
            return Err(TraceError::NotSupported);
        }
        self.bti.take().ok_or(TraceError::NotSupported)
    }
}

pub type Device = InsntraceDevice<FakeBti, FakeSys>;

/// A device plus handles on what its fakes record.
pub struct Rig {
    pub device: Device,
    pub memory: Rc<RefCell<Memory>>,
    pub kernel: Rc<RefCell<Kernel>>,
}

impl Rig {
    pub fn new(cpus: u32, cpu: &FakeCpu) -> Self {
        Self::with_config(cpus, cpu, DriverConfig::DEFAULT)
    }

    pub fn with_config(cpus: u32, cpu: &FakeCpu, config: DriverConfig) -> Self {
        let caps = probe(cpu).unwrap();
        let bti = FakeBti::new();
        let sys = FakeSys::new(cpus);
        let memory = Rc::clone(&bti.memory);
        let kernel = Rc::clone(&sys.kernel);
        Self {
            device: InsntraceDevice::new(caps, config, bti, sys),
            memory,
            kernel,
        }
    }

    pub fn live(&self) -> usize {
        self.memory.borrow().live
    }

    pub fn call(&self, op: Op) -> Result<(), TraceError> {
        self.device.ioctl(op.code(), &[], &mut []).map(|_| ())
    }

    pub fn alloc_trace(&self, mode: TraceMode, num_traces: u32) -> Result<(), TraceError> {
        let mut req = [0; TraceConfig::SIZE];
        TraceConfig { mode, num_traces }.encode(&mut req)?;
        self.device.ioctl(Op::AllocTrace.code(), &req, &mut []).map(|_| ())
    }

    pub fn trace_config(&self) -> Result<TraceConfig, TraceError> {
        let mut reply = [0; TraceConfig::SIZE];
        self.device.ioctl(Op::GetTraceConfig.code(), &[], &mut reply)?;
        TraceConfig::decode(&reply)
    }

    pub fn alloc_buffer(&self, config: &BufferConfig) -> Result<u32, TraceError> {
        let mut req = [0; BufferConfig::SIZE];
        config.encode(&mut req)?;
        let mut reply = [0; 4];
        self.device.ioctl(Op::AllocBuffer.code(), &req, &mut reply)?;
        Ok(u32::from_le_bytes(reply))
    }

    pub fn buffer_config(&self, descriptor: u32) -> Result<BufferConfig, TraceError> {
        let mut reply = [0; BufferConfig::SIZE];
        self.device
            .ioctl(Op::GetBufferConfig.code(), &descriptor.to_le_bytes(), &mut reply)?;
        BufferConfig::decode(&reply)
    }

    pub fn buffer_info(&self, descriptor: u32) -> Result<u64, TraceError> {
        let mut reply = [0; BufferInfo::SIZE];
        self.device
            .ioctl(Op::GetBufferInfo.code(), &descriptor.to_le_bytes(), &mut reply)?;
        BufferInfo::decode(&reply).map(|info| info.capture_end)
    }

    pub fn chunk_handle(&self, descriptor: u32, chunk_num: u32) -> Result<RawHandle, TraceError> {
        let mut req = [0; ChunkHandleRequest::SIZE];
        ChunkHandleRequest { descriptor, chunk_num }.encode(&mut req)?;
        let mut reply = [0; 4];
        self.device.ioctl(Op::GetChunkHandle.code(), &req, &mut reply)?;
        Ok(u32::from_le_bytes(reply))
    }

    pub fn free_buffer(&self, descriptor: u32) -> Result<(), TraceError> {
        self.device
            .ioctl(Op::FreeBuffer.code(), &descriptor.to_le_bytes(), &mut [])
            .map(|_| ())
    }
}

/// `num_chunks` single-page chunks, user and kernel branch tracing.
pub fn buffer(num_chunks: u32) -> BufferConfig {
    BufferConfig {
        num_chunks,
        ctl: Ia32RtitCtl::OS | Ia32RtitCtl::USER | Ia32RtitCtl::BRANCH_EN,
        ..BufferConfig::default()
    }
}
