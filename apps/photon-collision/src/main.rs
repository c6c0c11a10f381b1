//! Photon collision demo
//!
//! Scatters points in the unit cube and counts the pairs closer than a
//! radius with one zero-length ray per point, traced against an AABB
//! structure holding a box of half-width `radius` around every point.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release -p photon-collision -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--count <N>`: Number of points (default: 1000000)
//! - `--radius <R>`: Collision radius (default: 0.01)
//! - `--seed <N>`: Point generation seed (default: 0)
//! - `--device <host|vulkan>`: Device to run on (default: host)
//! - `--spirv <PATH>`: SPIR-V module with the collision programs (Vulkan only)
//! - `--compact`: Build for memory footprint instead of trace speed
//! - `--verify`: Compare against a CPU count
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)
//! - `PHOTON_DEVICE`: Default for `--device`
//! - `PHOTON_VALIDATION=1`: Force backend validation

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, ensure, Context as _};
use clap::{Parser, ValueEnum};
use photon_gpu::{Device, HostDeviceBuilder, VulkanDeviceBuilder};
use photon_rt::{DeviceContext, ModuleSource};
use photon_test::{collision, CollisionQuery, DeviceCloud, PointCloud};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum DeviceChoice {
    Host,
    Vulkan,
}

#[derive(Parser, Debug)]
#[command(name = "photon-collision")]
#[command(about = "Count colliding point pairs with ray traced AABB queries", long_about = None)]
struct Cli {
    /// Number of points
    #[arg(long, default_value_t = 1_000_000)]
    count: usize,

    /// Collision radius; also the half-width of every box
    #[arg(long, default_value_t = 1e-2)]
    radius: f32,

    /// Point generation seed
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Device to run on
    #[arg(long, value_enum, env = "PHOTON_DEVICE", default_value_t = DeviceChoice::Host)]
    device: DeviceChoice,

    /// SPIR-V module with the collision programs, required on Vulkan
    #[arg(long)]
    spirv: Option<PathBuf>,

    /// Compact the structure instead of building for trace speed
    #[arg(long)]
    compact: bool,

    /// Compare the result against a CPU count
    #[arg(long)]
    verify: bool,
}

fn bytes_to_spirv(bytes: &[u8]) -> anyhow::Result<Vec<u32>> {
    ensure!(
        bytes.len() % 4 == 0,
        "SPIR-V bytecode must be a whole number of words"
    );
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn load_spirv(path: &Path) -> anyhow::Result<ModuleSource> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(ModuleSource::Spirv(bytes_to_spirv(&bytes)?))
}

fn open_device(cli: &Cli) -> anyhow::Result<(Arc<dyn Device>, ModuleSource)> {
    match cli.device {
        DeviceChoice::Host => {
            let device: Arc<dyn Device> = HostDeviceBuilder::new().name("photon host").build()?;
            Ok((device, ModuleSource::Host(collision::host_image())))
        }
        DeviceChoice::Vulkan => {
            let Some(path) = &cli.spirv else {
                bail!("--spirv is required on the Vulkan device");
            };
            let source = load_spirv(path)?;
            let device: Arc<dyn Device> = VulkanDeviceBuilder::new()
                .app_name("photon-collision")
                .build()?;
            Ok((device, source))
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    ensure!(cli.radius > 0.0, "radius must be positive");

    let (device, source) = open_device(&cli)?;
    let context = DeviceContext::create(device.as_ref())?;
    let stream = device.default_stream();
    let allocator = device.default_allocator();
    info!(
        "Counting collisions of {} points (radius {}) on {}",
        cli.count,
        cli.radius,
        context.device_name()
    );

    let cloud = PointCloud::random(cli.count, cli.radius, cli.seed);
    let device_cloud = DeviceCloud::upload(&cloud, stream, &allocator)?;
    let query = CollisionQuery::new(&context, source, stream, &allocator)?;

    let start = Instant::now();
    let mut accel = context.create_accel_struct_aabb();
    accel.build(stream, &allocator, device_cloud.input(), !cli.compact, false)?;
    stream.sync()?;
    let build_time = start.elapsed();
    info!(
        "Built {} structure: {} bytes in {build_time:.2?}",
        accel.kind(),
        accel.memory_size()
    );

    let start = Instant::now();
    let count = query.run(stream, &accel, &device_cloud)?;
    let query_time = start.elapsed();

    let estimate = cloud.estimated_pairs();
    println!("Estimated collisions: {estimate:.1}");
    println!("Counted collisions:   {count}");
    println!("Ratio:                {:.4}", count as f64 / estimate);
    println!("Build time:           {build_time:.2?}");
    println!("Query time:           {query_time:.2?}");

    if cli.verify {
        let expected = cloud.count_pairs();
        ensure!(
            count == expected,
            "ray traced count {count} differs from the CPU count {expected}"
        );
        info!("Verified against the CPU count");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_are_little_endian() {
        let words = bytes_to_spirv(&[0x03, 0x02, 0x23, 0x07, 1, 0, 0, 0]).unwrap();
        assert_eq!(words, vec![0x0723_0203, 1]);
        assert!(bytes_to_spirv(&[1, 2, 3]).is_err());
    }

    #[test]
    fn defaults_match_the_demo() {
        let cli = Cli::parse_from(["photon-collision"]);
        assert_eq!(cli.count, 1_000_000);
        assert!((cli.radius - 0.01).abs() < f32::EPSILON);
        assert!(!cli.compact);
        assert!(cli.spirv.is_none());
    }

    #[test]
    fn vulkan_requires_spirv() {
        let cli = Cli::parse_from(["photon-collision", "--device", "vulkan"]);
        assert!(open_device(&cli).is_err());
    }
}
