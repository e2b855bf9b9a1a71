use clap::{Parser, Subcommand};
use rocflash::kernels::{HeadDimSupport, KernelKey};
use rocflash::logging::init_logging_from_env;
use rocflash::{DataType, Direction, GfxArch, KernelTable, KernelVariant};

#[derive(Parser, Debug)]
#[command(name = "rocflash-kernels", version)]
#[command(about = "Inspect the compiled flash attention kernel table", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List compiled kernel variants
    List {
        /// Only variants for this arch (e.g. gfx90a)
        #[arg(long)]
        arch: Option<GfxArch>,
        /// Only forward or backward variants
        #[arg(long)]
        direction: Option<Direction>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show the variant a call would dispatch to
    Select {
        /// Element type (fp16, bf16, fp32)
        #[arg(long)]
        dtype: DataType,
        /// Head dimension
        #[arg(long)]
        head_dim: usize,
        /// Causal masking
        #[arg(long)]
        causal: bool,
        /// fwd or bwd
        #[arg(long, default_value = "fwd")]
        direction: Direction,
        /// Target arch (defaults to the first compiled arch)
        #[arg(long)]
        arch: Option<GfxArch>,
        /// Prefer unfused variants, as a runner in unit-test mode does
        #[arg(long)]
        unit_test_mode: bool,
        /// Print JSON instead of the variant name
        #[arg(long)]
        json: bool,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging_from_env()?;
    let cli = Cli::parse();
    let table = KernelTable::compiled();

    match cli.command {
        Commands::List {
            arch,
            direction,
            json,
        } => {
            let listed = table.filter(|v| {
                arch.map_or(true, |a| v.arch == a) && direction.map_or(true, |d| v.direction == d)
            });
            if json {
                println!("{}", serde_json::to_string_pretty(listed.variants())?);
            } else {
                print_table(listed.variants());
            }
        }
        Commands::Select {
            dtype,
            head_dim,
            causal,
            direction,
            arch,
            unit_test_mode,
            json,
        } => {
            let arch = match arch {
                Some(arch) => arch,
                None => KernelTable::compiled_archs()
                    .first()
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("no offload arch compiled into this build"))?,
            };
            let key = KernelKey {
                direction,
                arch,
                dtype,
                head_dim,
                is_causal: causal,
            };
            let variant = table.select(&key, unit_test_mode)?;
            if json {
                println!("{}", serde_json::to_string_pretty(variant)?);
            } else {
                println!("{}", variant.name);
            }
        }
    }

    Ok(())
}

fn print_table(variants: &[KernelVariant]) {
    println!(
        "{:<48} {:>4} {:>7} {:>5} {:>5} {:>6}",
        "NAME", "DIR", "HDIM", "BM", "BN", "FUSED"
    );
    for v in variants {
        let head_dim = match v.head_dim {
            HeadDimSupport::Exact(d) => d.to_string(),
            HeadDimSupport::UpTo { max, .. } => format!("<={}", max),
        };
        println!(
            "{:<48} {:>4} {:>7} {:>5} {:>5} {:>6}",
            v.name, v.direction.as_str(), head_dim, v.traits.block_m, v.traits.block_n, v.traits.fused
        );
    }
    println!("{} variant(s), archs: {:?}", variants.len(), KernelTable::compiled_archs());
}
