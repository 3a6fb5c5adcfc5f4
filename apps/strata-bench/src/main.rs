//! Strata resource churn driver
//!
//! Runs a device through many frames of buffer, texture and view churn and
//! logs allocator and retirement statistics as it goes.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p strata-bench -- [OPTIONS]
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use anyhow::Context;
use strata_core::{
    BufferDesc, BufferUsage, BufferViewDesc, DescriptorClass, DeviceConfig, Format, MemoryDomain,
    QueueClass, TextureDesc, TextureUsage, TextureViewDesc, ViewAccess, ViewHandle,
};
use strata_gpu::{Backend, Device, DeviceStats, HeadlessBackend};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_FRAMES: u64 = 240;
const DEFAULT_PER_FRAME: u32 = 32;
const REPORT_EVERY: u64 = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BackendKind {
    Headless,
    #[cfg(feature = "vulkan")]
    Vulkan,
}

#[derive(Debug)]
struct Options {
    backend: BackendKind,
    frames: u64,
    per_frame: u32,
    seed: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            backend: BackendKind::Headless,
            frames: DEFAULT_FRAMES,
            per_frame: DEFAULT_PER_FRAME,
            seed: 42,
        }
    }
}

fn parse_args() -> anyhow::Result<Option<Options>> {
    let mut options = Options::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .with_context(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(None);
            }
            "-b" | "--backend" => {
                options.backend = match value("--backend")?.as_str() {
                    "headless" => BackendKind::Headless,
                    #[cfg(feature = "vulkan")]
                    "vulkan" => BackendKind::Vulkan,
                    other => anyhow::bail!("unknown backend {other:?}"),
                }
            }
            "-f" | "--frames" => options.frames = value("--frames")?.parse()?,
            "-n" | "--per-frame" => options.per_frame = value("--per-frame")?.parse()?,
            "--seed" => options.seed = value("--seed")?.parse()?,
            other => anyhow::bail!("unknown argument {other:?}, see --help"),
        }
    }
    Ok(Some(options))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };
    let config = DeviceConfig::new("strata-bench");
    info!(?options, "Strata resource churn");

    match options.backend {
        BackendKind::Headless => {
            let device = Device::new(HeadlessBackend::default(), config)?;
            run(&device, &options)
        }
        #[cfg(feature = "vulkan")]
        BackendKind::Vulkan => {
            let device = Device::<strata_gpu::VulkanBackend>::vulkan(config)?;
            run(&device, &options)
        }
    }
}

/// Small deterministic generator so runs are reproducible.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn run<B: Backend>(device: &Device<B>, options: &Options) -> anyhow::Result<()> {
    let mut rng = XorShift(options.seed.max(1));
    let mut live: Vec<ViewHandle> = Vec::new();
    let payload: Vec<u32> = (0..4096).collect();

    for frame in 0..options.frames {
        device.wait_for_frame_slot()?;
        device.begin_frame()?;

        for _ in 0..options.per_frame {
            if let Some(resource) = create_resource(device, &mut rng, &payload)? {
                live.push(resource);
            }
        }

        // Release roughly as many as were created so the working set stays flat
        let target = options.per_frame as usize * 4;
        while live.len() > target {
            let victim = live.swap_remove(rng.below(live.len() as u64) as usize);
            device.release(victim);
        }

        let table = device.acquire_descriptor_table(DescriptorClass::ShaderVisible)?;
        let mut list = device.begin_commands(QueueClass::Graphics)?;
        list.use_descriptor_table(table);
        device.submit(list)?;

        device.end_frame()?;

        if (frame + 1) % REPORT_EVERY == 0 {
            report(frame + 1, &device.stats());
        }
    }

    for view in live.drain(..) {
        device.release(view);
    }
    device.wait_idle()?;
    report(options.frames, &device.stats());
    Ok(())
}

fn create_resource<B: Backend>(
    device: &Device<B>,
    rng: &mut XorShift,
    payload: &[u32],
) -> anyhow::Result<Option<ViewHandle>> {
    if rng.below(4) == 0 {
        let size = 16u32 << rng.below(6);
        let desc = TextureDesc::d2(size, size, Format::Rgba8Unorm, TextureUsage::SAMPLED);
        let texture = device.create_texture(&desc)?;
        if texture.is_invalid() {
            return Ok(None);
        }
        let view = device.create_view(TextureViewDesc::new(texture, ViewAccess::ShaderRead))?;
        // The view holds its own reference
        device.release(texture);
        return Ok(Some(view));
    }

    let words = 64 + rng.below(payload.len() as u64 - 64) as usize;
    let domain = if rng.below(3) == 0 {
        MemoryDomain::Upload
    } else {
        MemoryDomain::Device
    };
    let usage = if rng.below(16) == 0 {
        BufferUsage::STORAGE | BufferUsage::STORAGE_WRITE
    } else {
        BufferUsage::STORAGE
    };
    let desc = BufferDesc::new(words as u64 * 4, usage).with_domain(domain);
    let buffer = device.create_buffer_init(&desc, &payload[..words])?;
    if buffer.is_invalid() {
        return Ok(None);
    }
    let view = device.create_view(BufferViewDesc::new(buffer, ViewAccess::ShaderRead))?;
    device.release(buffer);
    Ok(Some(view))
}

fn report(frame: u64, stats: &DeviceStats) {
    let shader_tables = stats.descriptor_tables[DescriptorClass::ShaderVisible.index()];
    info!(
        frame,
        buffers = stats.buffers,
        textures = stats.textures,
        views = stats.views,
        shared_pages = stats.persistent.shared_pages,
        dedicated = stats.persistent.dedicated_regions,
        allocated_bytes = stats.persistent.allocated_bytes,
        reserved_bytes = stats.persistent.reserved_bytes,
        transient_pages = stats.transient_pages,
        transient_in_flight = stats.transient_in_flight,
        pending_retirements = stats.pending_retirements,
        table_rebuilds = shader_tables.rebuilds,
        "churn statistics"
    );
}

fn print_help() {
    eprintln!(
        "Strata resource churn driver

USAGE:
    cargo run -p strata-bench -- [OPTIONS]

OPTIONS:
    -b, --backend <NAME>    headless or vulkan (default: headless)
    -f, --frames <N>        Frames to run (default: {DEFAULT_FRAMES})
    -n, --per-frame <N>     Resources created per frame (default: {DEFAULT_PER_FRAME})
    --seed <N>              Churn seed (default: 42)
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
