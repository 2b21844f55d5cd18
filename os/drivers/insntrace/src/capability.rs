//! Processor-trace capability detection.
//!
//! [`probe`] decodes CPUID into a [`Capabilities`] value; [`capabilities`]
//! runs it once per process and hands out the cached result.

use crate::config::MAX_NUM_ADDR_RANGES;
use crate::error::TraceError;
use kernel_cpuid::{CpuidRanges, CpuidSource, LEAF_14H, Leaf01h, Leaf07h, Leaf14h, Leaf15h};
use kernel_registers::Ia32RtitCtl;
use kernel_sync::SyncOnceCell;
use log::{error, info};

/// What the processor's trace unit supports.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    pub family: u16,
    pub model: u8,
    pub stepping: u8,

    /// Largest `ADDRn_CFG` encoding: 0 off, 1 filter, 2 stop.
    pub addr_cfg_max: u32,
    pub mtc_freq_mask: u16,
    pub cyc_thresh_mask: u16,
    pub psb_freq_mask: u16,
    /// Configurable IP filter ranges, `0..=4`.
    pub num_addr_ranges: u8,
    /// TSC to core crystal clock ratio, when enumerated.
    pub bus_freq_ratio: Option<u32>,

    pub cr3_filtering: bool,
    pub psb: bool,
    pub ip_filtering: bool,
    pub mtc: bool,
    pub ptwrite: bool,
    pub power_events: bool,

    pub output_topa: bool,
    pub output_topa_multi: bool,
    pub output_single: bool,
    pub output_transport: bool,
    pub lip: bool,
}

/// Decode the trace capabilities of the CPU behind `source`.
///
/// # Errors
/// [`TraceError::NotSupported`] if CPUID leaf 14H or the Intel PT feature
/// bit is missing.
pub fn probe(source: &impl CpuidSource) -> Result<Capabilities, TraceError> {
    let ranges = CpuidRanges::read(source);
    let Some(pt) = Leaf14h::read(source, &ranges) else {
        info!("IntelPT: no PT support (max basic leaf {:#x})", ranges.max_basic);
        return Err(TraceError::NotSupported);
    };

    let mut caps = Capabilities::default();
    if let Some(version) = Leaf01h::read(source, &ranges) {
        caps.family = version.family();
        caps.model = version.model();
        caps.stepping = version.stepping();
    }

    if !Leaf07h::read(source, &ranges).is_some_and(|l| l.has_intel_pt()) {
        info!("IntelPT: no PT support");
        return Err(TraceError::NotSupported);
    }

    if pt.ebx.ip_filtering() {
        caps.addr_cfg_max = 2;
    }
    if let Some(sub1) = pt.sub1 {
        caps.mtc_freq_mask = sub1.eax.mtc_freq_mask();
        caps.cyc_thresh_mask = sub1.ebx.cyc_thresh_mask();
        caps.psb_freq_mask = sub1.ebx.psb_freq_mask();
        caps.num_addr_ranges = sub1.eax.num_addr_ranges();
    }
    caps.bus_freq_ratio = Leaf15h::read(source, &ranges).and_then(|l| l.bus_freq_ratio());

    caps.cr3_filtering = pt.ebx.cr3_filtering();
    caps.psb = pt.ebx.psb_cyc();
    caps.ip_filtering = pt.ebx.ip_filtering();
    caps.mtc = pt.ebx.mtc();
    caps.ptwrite = pt.ebx.ptwrite();
    caps.power_events = pt.ebx.power_events();

    caps.output_topa = pt.ecx.topa();
    caps.output_topa_multi = pt.ecx.topa_multi();
    caps.output_single = pt.ecx.single_range();
    caps.output_transport = pt.ecx.transport();
    caps.lip = pt.ecx.lip();

    info!(
        "Intel Processor Trace on family {:#x} model {:#x} stepping {}: \
         mtc_freq_mask {:#x}, cyc_thresh_mask {:#x}, psb_freq_mask {:#x}, {} addr ranges",
        caps.family,
        caps.model,
        caps.stepping,
        caps.mtc_freq_mask,
        caps.cyc_thresh_mask,
        caps.psb_freq_mask,
        caps.num_addr_ranges
    );

    Ok(caps)
}

static CAPABILITIES: SyncOnceCell<Capabilities> = SyncOnceCell::new();

/// The process-wide capability set, probed through `source` on first use.
///
/// A failed probe is not cached; the next caller probes again.
///
/// # Errors
/// See [`probe`].
pub fn capabilities(source: &impl CpuidSource) -> Result<&'static Capabilities, TraceError> {
    CAPABILITIES.get_or_try_init(|| probe(source))
}

impl Capabilities {
    /// `IA32_RTIT_CTL` bits a client may request.
    #[must_use]
    pub fn settable_ctl_mask(&self) -> u64 {
        let mut mask = Ia32RtitCtl::OS
            | Ia32RtitCtl::USER
            | Ia32RtitCtl::TSC_EN
            | Ia32RtitCtl::DIS_RETC
            | Ia32RtitCtl::BRANCH_EN;
        if self.ptwrite {
            mask |= Ia32RtitCtl::PTW_EN | Ia32RtitCtl::FUP_ON_PTW;
        }
        if self.cr3_filtering {
            mask |= Ia32RtitCtl::CR3_FILTER;
        }
        if self.mtc {
            mask |= Ia32RtitCtl::MTC_EN | Ia32RtitCtl::MTC_FREQ_MASK;
        }
        if self.power_events {
            mask |= Ia32RtitCtl::PWR_EVT_EN;
        }
        if self.ip_filtering {
            let ranges = usize::from(self.num_addr_ranges).min(MAX_NUM_ADDR_RANGES);
            for n in 0..ranges {
                mask |= Ia32RtitCtl::addr_cfg_mask(n);
            }
        }
        if self.psb {
            mask |= Ia32RtitCtl::CYC_EN | Ia32RtitCtl::PSB_FREQ_MASK | Ia32RtitCtl::CYC_THRESH_MASK;
        }
        mask
    }

    /// Check a requested `IA32_RTIT_CTL` value against this processor.
    ///
    /// # Errors
    /// [`TraceError::InvalidArgs`] if a bit outside [`Self::settable_ctl_mask`]
    /// is set, a frequency field selects an encoding the processor does not
    /// list, or an `ADDRn_CFG` field is above [`Self::addr_cfg_max`].
    pub fn validate_ctl(&self, ctl: u64) -> Result<(), TraceError> {
        let settable = self.settable_ctl_mask();
        if ctl & !settable != 0 {
            error!("bad ctl, requested {ctl:#x}, valid {settable:#x}");
            return Err(TraceError::InvalidArgs);
        }

        let reg = Ia32RtitCtl::from_bits(ctl);
        let fields = [
            ("mtc_freq", reg.mtc_freq(), self.mtc_freq_mask),
            ("cyc_thresh", reg.cyc_thresh(), self.cyc_thresh_mask),
            ("psb_freq", reg.psb_freq(), self.psb_freq_mask),
        ];
        for (name, code, valid) in fields {
            if code != 0 && (1u32 << code) & u32::from(valid) == 0 {
                error!("bad {name} value, requested {code:#x}, valid mask {valid:#x}");
                return Err(TraceError::InvalidArgs);
            }
        }
        for n in 0..Ia32RtitCtl::NUM_ADDR_CFG {
            if let Some(cfg) = reg.addr_cfg(n)
                && u32::from(cfg) > self.addr_cfg_max
            {
                error!("bad addr{n}_cfg value, requested {cfg}, max {}", self.addr_cfg_max);
                return Err(TraceError::InvalidArgs);
            }
        }
        Ok(())
    }
}
