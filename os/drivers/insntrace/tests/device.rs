mod common;

use common::{FakeCpu, PAGE, Rig, buffer};
use insntrace::{
    BufferConfig, DriverConfig, InsntraceAction, Op, Rights, ThreadBufferRequest, TraceConfig, TraceError, TraceMode,
    Wire,
};
use kernel_registers::{Ia32RtitCtl, Ia32RtitOutputMaskPtrs, Ia32RtitStatus};

const CPUS: TraceMode = TraceMode::Cpus;

/// A two-CPU session with one four-chunk buffer per CPU.
fn ready() -> Rig {
    let rig = Rig::new(2, &FakeCpu::full());
    rig.device.open().unwrap();
    rig.alloc_trace(CPUS, 2).unwrap();
    assert_eq!(rig.alloc_buffer(&buffer(4)), Ok(0));
    assert_eq!(rig.alloc_buffer(&buffer(4)), Ok(1));
    rig
}

#[test]
fn full_session() {
    use InsntraceAction::{AllocTrace, FreeTrace, GetTraceData, StageTraceData, Start, Stop};

    let rig = ready();
    assert_eq!(
        rig.trace_config(),
        Ok(TraceConfig {
            mode: CPUS,
            num_traces: 2
        })
    );
    // 4 chunks and a table per buffer.
    assert_eq!(rig.live(), 10);
    let first_table = rig.memory.borrow().allocations[4].pa.as_u64();

    rig.call(Op::Start).unwrap();
    {
        let kernel = rig.kernel.borrow();
        let staged = kernel.staged[&0];
        assert!(staged.ctl().trace_en() && staged.ctl().topa() && staged.ctl().branch_en());
        assert_eq!(staged.output_base, first_table);
        assert_eq!(staged.output_mask_ptrs, 0);
        assert_eq!(kernel.staged.len(), 2);
    }
    assert_eq!(rig.buffer_info(0), Err(TraceError::BadState));

    rig.kernel.borrow_mut().write_position = Ia32RtitOutputMaskPtrs::at(2, 0x123).into_bits();
    rig.call(Op::Stop).unwrap();

    let end = rig.buffer_info(0).unwrap();
    assert_eq!(end, 2 * PAGE + 0x123);
    assert!(0 < end && end < 4 * PAGE);

    let config = rig.buffer_config(1).unwrap();
    assert_eq!(config.num_chunks, 4);
    assert!(!Ia32RtitCtl::from_bits(config.ctl).trace_en());

    rig.chunk_handle(0, 3).unwrap();
    assert_eq!(rig.chunk_handle(0, 4), Err(TraceError::InvalidArgs));
    let (pa, rights) = rig.memory.borrow().exported[0];
    assert_eq!(pa, rig.memory.borrow().allocations[3].pa);
    assert!(rights.read() && rights.map() && !rights.write() && !rights.duplicate());
    assert_eq!(rights, Rights::TRACE_EXPORT);

    rig.free_buffer(0).unwrap();
    rig.free_buffer(1).unwrap();
    rig.call(Op::FreeTrace).unwrap();
    assert_eq!(rig.live(), 0);

    assert_eq!(
        rig.kernel.borrow().calls,
        [
            (AllocTrace, 0),
            (StageTraceData, 0),
            (StageTraceData, 1),
            (Start, 0),
            (Stop, 0),
            (GetTraceData, 0),
            (GetTraceData, 1),
            (FreeTrace, 0),
        ]
    );
}

#[test]
fn start_needs_every_slot_allocated() {
    let rig = Rig::new(2, &FakeCpu::full());
    rig.alloc_trace(CPUS, 2).unwrap();
    assert_eq!(rig.call(Op::Start), Err(TraceError::BadState));
    rig.alloc_buffer(&buffer(2)).unwrap();
    assert_eq!(rig.call(Op::Start), Err(TraceError::BadState));
    assert_eq!(rig.call(Op::Stop), Err(TraceError::BadState));
    rig.alloc_buffer(&buffer(2)).unwrap();
    rig.call(Op::Start).unwrap();
}

#[test]
fn active_session_refuses_teardown() {
    let rig = ready();
    rig.call(Op::Start).unwrap();

    assert_eq!(rig.call(Op::Start), Err(TraceError::BadState));
    assert_eq!(rig.free_buffer(0), Err(TraceError::BadState));
    assert_eq!(rig.call(Op::FreeTrace), Err(TraceError::BadState));
    assert_eq!(rig.alloc_trace(CPUS, 2), Err(TraceError::BadState));
    assert_eq!(rig.live(), 10);

    rig.call(Op::Stop).unwrap();
    rig.call(Op::FreeTrace).unwrap();
    assert_eq!(rig.live(), 0);
}

#[test]
fn failed_start_keeps_slots_staged() {
    let rig = ready();
    rig.kernel.borrow_mut().fail = Some((InsntraceAction::Start, TraceError::Internal));
    assert_eq!(rig.call(Op::Start), Err(TraceError::Internal));

    // Both slots stay staged.
    assert_eq!(rig.call(Op::Stop), Err(TraceError::BadState));
    assert_eq!(rig.free_buffer(0), Err(TraceError::BadState));
    assert_eq!(rig.call(Op::FreeTrace), Err(TraceError::BadState));
    assert_eq!(rig.call(Op::Start), Err(TraceError::BadState));
}

#[test]
fn unsupported_ctl_bits_allocate_nothing() {
    let rig = Rig::new(1, &FakeCpu::full().without_ptwrite());
    rig.alloc_trace(CPUS, 1).unwrap();

    let config = BufferConfig {
        ctl: buffer(4).ctl | Ia32RtitCtl::PTW_EN,
        ..buffer(4)
    };
    assert_eq!(rig.alloc_buffer(&config), Err(TraceError::InvalidArgs));

    // PSB frequency code 7 is not in the mask 0x3F.
    let config = BufferConfig {
        ctl: buffer(4).ctl | (7 << Ia32RtitCtl::PSB_FREQ_SHIFT),
        ..buffer(4)
    };
    assert_eq!(rig.alloc_buffer(&config), Err(TraceError::InvalidArgs));

    assert!(rig.memory.borrow().allocations.is_empty());
    assert_eq!(rig.live(), 0);

    let config = BufferConfig {
        ctl: buffer(4).ctl | (5 << Ia32RtitCtl::PSB_FREQ_SHIFT),
        ..buffer(4)
    };
    assert_eq!(rig.alloc_buffer(&config), Ok(0));
}

#[test]
fn bad_geometry_is_rejected() {
    let rig = Rig::new(1, &FakeCpu::full());
    rig.alloc_trace(CPUS, 1).unwrap();
    for (num_chunks, chunk_order) in [(0, 0), (4097, 0), (1, 9), (512, 8)] {
        let config = BufferConfig {
            num_chunks,
            chunk_order,
            ..buffer(1)
        };
        assert_eq!(rig.alloc_buffer(&config), Err(TraceError::InvalidArgs));
    }
    assert!(rig.memory.borrow().allocations.is_empty());
}

#[test]
fn allocation_failure_leaves_the_slot_free() {
    let rig = Rig::new(1, &FakeCpu::full());
    rig.alloc_trace(CPUS, 1).unwrap();
    rig.memory.borrow_mut().fail_after = Some(3);
    assert_eq!(rig.alloc_buffer(&buffer(4)), Err(TraceError::NoMemory));
    assert_eq!(rig.live(), 0);

    rig.memory.borrow_mut().fail_after = None;
    assert_eq!(rig.alloc_buffer(&buffer(4)), Ok(0));
}

#[test]
fn slots_are_handed_out_in_order() {
    let rig = Rig::new(3, &FakeCpu::full());
    rig.alloc_trace(CPUS, 3).unwrap();
    for expected in 0..3 {
        assert_eq!(rig.alloc_buffer(&buffer(1)), Ok(expected));
    }
    assert_eq!(rig.alloc_buffer(&buffer(1)), Err(TraceError::NoResources));

    rig.free_buffer(1).unwrap();
    assert_eq!(rig.free_buffer(1), Err(TraceError::InvalidArgs));
    assert_eq!(rig.alloc_buffer(&buffer(1)), Ok(1));
}

#[test]
fn descriptors_are_checked() {
    let rig = Rig::new(2, &FakeCpu::full());
    rig.alloc_trace(CPUS, 2).unwrap();
    rig.alloc_buffer(&buffer(2)).unwrap();

    assert_eq!(rig.buffer_config(1), Err(TraceError::InvalidArgs));
    assert_eq!(rig.buffer_config(2), Err(TraceError::InvalidArgs));
    assert_eq!(rig.buffer_info(1), Err(TraceError::InvalidArgs));
    assert_eq!(rig.chunk_handle(1, 0), Err(TraceError::InvalidArgs));
    assert_eq!(rig.chunk_handle(0, 2), Err(TraceError::InvalidArgs));
    assert_eq!(rig.free_buffer(7), Err(TraceError::InvalidArgs));
    // Nothing captured yet.
    assert_eq!(rig.buffer_info(0), Ok(0));
}

#[test]
fn cpu_mode_traces_every_cpu() {
    let rig = Rig::new(4, &FakeCpu::full());
    assert_eq!(rig.alloc_trace(CPUS, 3), Err(TraceError::InvalidArgs));
    assert_eq!(rig.alloc_trace(CPUS, 257), Err(TraceError::InvalidArgs));
    assert_eq!(rig.alloc_trace(TraceMode::Threads, 0), Err(TraceError::InvalidArgs));
    assert!(rig.kernel.borrow().calls.is_empty());

    rig.alloc_trace(CPUS, 4).unwrap();
    assert_eq!(rig.kernel.borrow().trace_config.map(|c| c.num_traces), Some(4));
}

#[test]
fn rejected_reservation_is_rolled_back() {
    let rig = Rig::new(1, &FakeCpu::full());
    rig.kernel.borrow_mut().fail = Some((InsntraceAction::AllocTrace, TraceError::NoResources));
    assert_eq!(rig.alloc_trace(CPUS, 1), Err(TraceError::NoResources));
    assert_eq!(rig.trace_config(), Err(TraceError::BadState));
    rig.alloc_trace(CPUS, 1).unwrap();
}

#[test]
fn single_entry_topa_limits_buffers() {
    let rig = Rig::new(1, &FakeCpu::minimal());
    rig.alloc_trace(CPUS, 1).unwrap();
    let config = BufferConfig {
        ctl: Ia32RtitCtl::USER,
        ..buffer(2)
    };
    assert_eq!(rig.alloc_buffer(&config), Err(TraceError::NotSupported));
    assert_eq!(rig.live(), 0);

    let config = BufferConfig {
        num_chunks: 1,
        chunk_order: 8,
        ..config
    };
    assert_eq!(rig.alloc_buffer(&config), Ok(0));
    // MTC is not enumerated.
    let config = BufferConfig {
        ctl: Ia32RtitCtl::USER | Ia32RtitCtl::MTC_EN,
        ..config
    };
    assert_eq!(rig.alloc_buffer(&config), Err(TraceError::InvalidArgs));
}

#[test]
fn no_topa_output_means_no_trace() {
    let mut cpu = FakeCpu::minimal();
    cpu.leaf14[0].ecx = 0;
    let rig = Rig::new(1, &cpu);
    assert_eq!(rig.alloc_trace(CPUS, 1), Err(TraceError::NotSupported));
}

#[test]
fn capture_end_in_a_later_table() {
    // Three chunks per table.
    let config = DriverConfig::DEFAULT.with_topa_table_entries(4);
    let rig = Rig::with_config(1, &FakeCpu::full(), config);
    rig.alloc_trace(CPUS, 1).unwrap();
    rig.alloc_buffer(&buffer(8)).unwrap();
    // 8 chunks, then 3 tables.
    assert_eq!(rig.memory.borrow().allocations.len(), 11);
    let second_table = rig.memory.borrow().allocations[9].pa.as_u64();

    rig.call(Op::Start).unwrap();
    {
        let mut kernel = rig.kernel.borrow_mut();
        kernel.output_base = Some(second_table);
        kernel.write_position = Ia32RtitOutputMaskPtrs::at(1, 0x40).into_bits();
    }
    rig.call(Op::Stop).unwrap();
    assert_eq!(rig.buffer_info(0), Ok(4 * PAGE + 0x40));

    // A position outside the ring reports nothing captured.
    rig.kernel.borrow_mut().output_base = Some(0x7777_0000);
    rig.call(Op::Start).unwrap();
    rig.call(Op::Stop).unwrap();
    assert_eq!(rig.buffer_info(0), Ok(0));
}

#[test]
fn hardware_error_status_is_not_fatal() {
    let rig = ready();
    rig.call(Op::Start).unwrap();
    rig.kernel.borrow_mut().status = Ia32RtitStatus::ERROR;
    rig.call(Op::Stop).unwrap();
    let config = rig.buffer_config(0).unwrap();
    assert_eq!(config.num_chunks, 4);
    rig.call(Op::Start).unwrap();
}

#[test]
fn stopped_status_keeps_the_final_position() {
    let rig = Rig::new(1, &FakeCpu::full());
    rig.alloc_trace(CPUS, 1).unwrap();
    rig.alloc_buffer(&buffer(4)).unwrap();
    rig.call(Op::Start).unwrap();
    {
        let mut kernel = rig.kernel.borrow_mut();
        kernel.status = Ia32RtitStatus::STOPPED;
        kernel.write_position = Ia32RtitOutputMaskPtrs::at(3, 0x800).into_bits();
    }
    rig.call(Op::Stop).unwrap();
    assert_eq!(rig.buffer_info(0), Ok(3 * PAGE + 0x800));
    assert!(!rig.buffer_config(0).unwrap().is_circular);
}

#[test]
fn failed_stop_keeps_tracing() {
    let rig = ready();
    rig.call(Op::Start).unwrap();
    rig.kernel.borrow_mut().fail = Some((InsntraceAction::Stop, TraceError::Internal));
    assert_eq!(rig.call(Op::Stop), Err(TraceError::Internal));
    assert_eq!(rig.buffer_info(0), Err(TraceError::BadState));
    rig.call(Op::Stop).unwrap();
}

#[test]
fn failed_hardware_release_is_defunct() {
    let rig = ready();
    rig.kernel.borrow_mut().fail = Some((InsntraceAction::FreeTrace, TraceError::Internal));
    assert_eq!(rig.call(Op::FreeTrace), Err(TraceError::Defunct));
    assert_eq!(rig.live(), 0);

    assert_eq!(rig.trace_config(), Err(TraceError::Defunct));
    assert_eq!(rig.call(Op::Start), Err(TraceError::Defunct));
    assert_eq!(rig.alloc_trace(CPUS, 2), Err(TraceError::Defunct));
    rig.device.release();
}

#[test]
fn one_client_at_a_time() {
    let rig = Rig::new(1, &FakeCpu::full());
    rig.device.open().unwrap();
    assert!(rig.device.is_open());
    assert_eq!(rig.device.open(), Err(TraceError::AlreadyBound));
    rig.device.close();
    rig.device.open().unwrap();
}

#[test]
fn release_tears_down_an_active_session() {
    let rig = ready();
    rig.call(Op::Start).unwrap();
    let Rig { device, memory, kernel } = rig;
    device.release();

    assert_eq!(memory.borrow().live, 0);
    let kernel = kernel.borrow();
    let calls = &kernel.calls;
    assert_eq!(calls[calls.len() - 1], (InsntraceAction::FreeTrace, 0));
    assert!(calls.contains(&(InsntraceAction::Stop, 0)));
}

#[test]
fn release_keeps_buffers_pinned_while_tracing() {
    let rig = ready();
    rig.call(Op::Start).unwrap();
    rig.kernel.borrow_mut().fail = Some((InsntraceAction::Stop, TraceError::Internal));
    let pinned = rig.live();
    let Rig { device, memory, kernel } = rig;
    device.release();

    // 2 x (4 chunks + 1 table).
    assert_eq!(pinned, 10);
    assert_eq!(memory.borrow().live, pinned);
    let kernel = kernel.borrow();
    assert!(!kernel.calls.contains(&(InsntraceAction::Stop, 0)));
    assert!(!kernel.calls.contains(&(InsntraceAction::FreeTrace, 0)));
}

#[test]
fn release_keeps_staged_buffers_pinned() {
    let rig = ready();
    rig.kernel.borrow_mut().fail = Some((InsntraceAction::Start, TraceError::Internal));
    assert_eq!(rig.call(Op::Start), Err(TraceError::Internal));
    let Rig { device, memory, kernel } = rig;
    device.release();

    assert_eq!(memory.borrow().live, 10);
    let kernel = kernel.borrow();
    assert_eq!(kernel.staged.len(), 2);
    assert!(!kernel.calls.contains(&(InsntraceAction::FreeTrace, 0)));
}

#[test]
fn release_frees_buffers_after_a_failed_retrieval() {
    let rig = ready();
    rig.call(Op::Start).unwrap();
    rig.kernel.borrow_mut().fail = Some((InsntraceAction::GetTraceData, TraceError::Internal));
    let Rig { device, memory, kernel } = rig;
    device.release();

    // The unit is stopped, so nothing can write to the buffers any more.
    assert_eq!(memory.borrow().live, 0);
    let kernel = kernel.borrow();
    assert!(kernel.calls.contains(&(InsntraceAction::Stop, 0)));
    assert_eq!(kernel.calls.last(), Some(&(InsntraceAction::FreeTrace, 0)));
}

#[test]
fn request_lengths_are_checked() {
    let rig = Rig::new(1, &FakeCpu::full());
    let d = &rig.device;
    assert_eq!(d.ioctl(0x2600, &[], &mut []), Err(TraceError::InvalidArgs));
    assert_eq!(d.ioctl(Op::Stop.code() + 1, &[], &mut []), Err(TraceError::InvalidArgs));
    assert_eq!(d.ioctl(Op::AllocTrace.code(), &[0; 4], &mut []), Err(TraceError::InvalidArgs));
    rig.alloc_trace(CPUS, 1).unwrap();

    assert_eq!(d.ioctl(Op::Start.code(), &[0], &mut []), Err(TraceError::InvalidArgs));
    assert_eq!(d.ioctl(Op::Stop.code(), &[], &mut [0]), Err(TraceError::InvalidArgs));
    assert_eq!(d.ioctl(Op::AllocBuffer.code(), &[0; 95], &mut [0; 4]), Err(TraceError::InvalidArgs));
    assert_eq!(d.ioctl(Op::GetTraceConfig.code(), &[], &mut [0; 7]), Err(TraceError::BufferTooSmall));
    assert_eq!(d.ioctl(Op::GetBufferInfo.code(), &[0; 4], &mut [0; 7]), Err(TraceError::BufferTooSmall));
    assert_eq!(d.ioctl(Op::GetBufferConfig.code(), &[0; 5], &mut [0; 96]), Err(TraceError::InvalidArgs));
    assert_eq!(d.ioctl(Op::FreeBuffer.code(), &[0; 4], &mut [0; 4]), Err(TraceError::InvalidArgs));

    let mut req = [0; BufferConfig::SIZE];
    buffer(2).encode(&mut req).unwrap();
    assert_eq!(d.ioctl(Op::AllocBuffer.code(), &req, &mut [0; 3]), Err(TraceError::BufferTooSmall));
    assert_eq!(rig.live(), 0);

    let mut reply = [0; 16];
    assert_eq!(d.ioctl(Op::AllocBuffer.code(), &req, &mut reply), Ok(4));
    assert_eq!(d.ioctl(Op::GetTraceConfig.code(), &[], &mut reply), Ok(8));
}

#[test]
fn thread_requests_consume_the_handle() {
    let rig = Rig::new(2, &FakeCpu::full());
    let request = |thread| {
        let mut req = [0; ThreadBufferRequest::SIZE];
        ThreadBufferRequest { descriptor: 0, thread }.encode(&mut req).unwrap();
        req
    };

    assert_eq!(
        rig.device.ioctl(Op::AssignThreadBuffer.code(), &request(11), &mut []),
        Err(TraceError::BadState)
    );

    rig.alloc_trace(TraceMode::Threads, 2).unwrap();
    rig.alloc_buffer(&buffer(2)).unwrap();
    assert_eq!(
        rig.device.ioctl(Op::AssignThreadBuffer.code(), &request(12), &mut []),
        Err(TraceError::NotSupported)
    );
    assert_eq!(
        rig.device.ioctl(Op::ReleaseThreadBuffer.code(), &request(13), &mut []),
        Err(TraceError::NotSupported)
    );
    assert_eq!(rig.kernel.borrow().closed, [11, 12, 13]);

    // Thread buffers can be inspected, but CPU-wide start is refused.
    assert_eq!(rig.buffer_info(0), Ok(0));
    assert_eq!(rig.call(Op::Start), Err(TraceError::BadState));
}
