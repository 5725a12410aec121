//! eBPF probe loader and lifecycle management

use std::path::Path;

use aya::{
    maps::{MapError, PerCpuArray, RingBuf},
    programs::{kprobe::KProbeLinkId, KProbe, KProbeError, ProgramError},
    sys::SyscallError,
    Ebpf, EbpfError, EbpfLoader,
};
use rqtap_common::{DROPPED_MAP, NR_RUNNING_OFFSET_GLOBAL, PROBE_PROGRAM, SAMPLES_MAP};
use tracing::{debug, info, warn};

use super::{btf, channel::RingBufChannel, ProbeHost};
use crate::config::Settings;
use crate::{Result, RqtapError};

/// Probe object compiled by build.rs
static RQ_PROBE: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/rq_probe"));

/// Manages the run queue kprobe lifecycle
pub struct KprobeHost {
    hook: String,
    nr_running_offset: Option<u32>,
    bytecode: &'static [u8],
    bpf: Option<Ebpf>,
    link: Option<KProbeLinkId>,
}

impl KprobeHost {
    pub fn new(settings: &Settings) -> Self {
        Self::with_bytecode(settings, RQ_PROBE)
    }

    /// Use a different probe object (for testing)
    pub fn with_bytecode(settings: &Settings, bytecode: &'static [u8]) -> Self {
        Self {
            hook: settings.hook.clone(),
            nr_running_offset: settings.nr_running_offset,
            bytecode,
            bpf: None,
            link: None,
        }
    }

    fn bpf_mut(&mut self) -> std::result::Result<&mut Ebpf, String> {
        self.bpf
            .as_mut()
            .ok_or_else(|| "probe is not loaded".to_string())
    }

    fn program_mut(bpf: &mut Ebpf) -> std::result::Result<&mut KProbe, String> {
        bpf.program_mut(PROBE_PROGRAM)
            .ok_or_else(|| format!("{} program not found in eBPF object", PROBE_PROGRAM))?
            .try_into()
            .map_err(|e| format!("{} is not a kprobe: {}", PROBE_PROGRAM, e))
    }
}

impl ProbeHost for KprobeHost {
    type Channel = RingBufChannel;

    fn open(&mut self) -> Result<()> {
        info!("Loading run queue probe...");
        if self.bytecode.is_empty() {
            return Err(RqtapError::load(
                "probe object is empty; rebuild with bpf-linker installed",
            ));
        }

        let offset =
            btf::nr_running_offset(self.nr_running_offset, Path::new(btf::VMLINUX_BTF));
        let mut bpf = EbpfLoader::new()
            .set_global(NR_RUNNING_OFFSET_GLOBAL, &offset, true)
            .load(self.bytecode)
            .map_err(|e| RqtapError::Load {
                reason: e.to_string(),
                errno: ebpf_errno(&e),
            })?;

        let program = Self::program_mut(&mut bpf).map_err(RqtapError::load)?;
        program.load().map_err(|e| {
            debug!("verifier rejected {}: {:?}", PROBE_PROGRAM, e);
            RqtapError::Load {
                reason: e.to_string(),
                errno: program_errno(&e),
            }
        })?;

        info!("Probe verified (nr_running offset {})", offset);
        self.bpf = Some(bpf);
        Ok(())
    }

    fn attach(&mut self) -> Result<()> {
        info!("Attaching kprobe to {}...", self.hook);
        let hook = self.hook.clone();

        let program = self
            .bpf_mut()
            .and_then(Self::program_mut)
            .map_err(|reason| RqtapError::Attach {
                hook: hook.clone(),
                reason,
                errno: None,
            })?;
        let link = program.attach(&hook, 0).map_err(|e| RqtapError::Attach {
            hook: hook.clone(),
            reason: e.to_string(),
            errno: program_errno(&e),
        })?;

        self.link = Some(link);
        info!("Kprobe attached to {}", hook);
        Ok(())
    }

    fn channel(&mut self) -> Result<RingBufChannel> {
        let bpf = self.bpf_mut().map_err(RqtapError::Channel)?;
        // Collect map names first to avoid borrow conflict in error path
        let available_maps: Vec<_> = bpf.maps().map(|(name, _)| name.to_string()).collect();
        let map = bpf.take_map(SAMPLES_MAP).ok_or_else(|| {
            RqtapError::Channel(format!(
                "{} map not found in eBPF object. Available maps: {:?}",
                SAMPLES_MAP, available_maps
            ))
        })?;

        let ring_buf = RingBuf::try_from(map)
            .map_err(|e| RqtapError::Channel(format!("{} is not a ring buffer: {}", SAMPLES_MAP, e)))?;
        RingBufChannel::new(ring_buf).map_err(|e| RqtapError::Channel(e.to_string()))
    }

    fn detach(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };
        let hook = self.hook.clone();
        let Some(bpf) = self.bpf.as_mut() else {
            return;
        };

        match Self::program_mut(bpf) {
            Ok(program) => match program.detach(link) {
                Ok(()) => info!("Kprobe detached from {}", hook),
                Err(e) => warn!("Failed to detach kprobe from {}: {}", hook, e),
            },
            Err(e) => warn!("Failed to detach kprobe from {}: {}", hook, e),
        }
    }

    fn destroy(&mut self) {
        if let Some(bpf) = self.bpf.take() {
            info!("Unloading eBPF probe...");
            drop(bpf);
            info!("Probe unloaded");
        }
    }

    fn dropped_samples(&self) -> Option<u64> {
        let map = self.bpf.as_ref()?.map(DROPPED_MAP)?;
        let counters = PerCpuArray::<_, u64>::try_from(map)
            .map_err(|e| warn!("Failed to open {} map: {}", DROPPED_MAP, e))
            .ok()?;
        let values = counters
            .get(&0, 0)
            .map_err(|e| warn!("Failed to read {} map: {}", DROPPED_MAP, e))
            .ok()?;
        Some(values.iter().sum())
    }
}

/// OS error code behind a program load or attach failure, when aya kept one
fn program_errno(e: &ProgramError) -> Option<i32> {
    match e {
        ProgramError::LoadError { io_error, .. }
        | ProgramError::SyscallError(SyscallError { io_error, .. })
        | ProgramError::KProbeError(KProbeError::FileError { io_error, .. })
        | ProgramError::MapError(MapError::CreateError { io_error, .. })
        | ProgramError::IOError(io_error) => io_error.raw_os_error(),
        _ => None,
    }
}

fn ebpf_errno(e: &EbpfError) -> Option<i32> {
    match e {
        EbpfError::FileError { error, .. } => error.raw_os_error(),
        EbpfError::MapError(MapError::CreateError { io_error, .. }) => io_error.raw_os_error(),
        EbpfError::ProgramError(e) => program_errno(e),
        _ => None,
    }
}
