use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use miette::{Context, IntoDiagnostic};

use halo_backend_core::TARGETS;
use halo_backend_vulkan::executable::{self, HEADER_LEN};
use halo_backend_vulkan::{VulkanSpirvTargetOptions, parse_workgroup_size};

/// halo: inspect hardware targets and packed executables
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the registered hardware targets
    Targets {
        /// Register the Vulkan target on the generic loop-nest path
        #[arg(long)]
        use_linalg_path: bool,

        /// Workgroup size forced on the generic path, e.g. "8,8,1"
        #[arg(long, value_parser = parse_size)]
        linalg_workgroup_size: Option<[u32; 3]>,
    },

    /// Validate and describe a packed SPIR-V executable definition
    Inspect {
        /// Packed executable definition
        input: PathBuf,

        /// Write the SPIR-V code to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn parse_size(s: &str) -> Result<[u32; 3], String> {
    parse_workgroup_size(s).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> miette::Result<()> {
    match Cli::parse().command {
        Command::Targets {
            use_linalg_path,
            linalg_workgroup_size,
        } => {
            halo_backend_vulkan::register_with(VulkanSpirvTargetOptions {
                use_linalg_path,
                linalg_workgroup_size,
            });
            for name in TARGETS.names() {
                println!("{name}");
            }
            Ok(())
        }
        Command::Inspect { input, output } => inspect(&input, output.as_ref()),
    }
}

fn inspect(input: &PathBuf, output: Option<&PathBuf>) -> miette::Result<()> {
    let bytes = std::fs::read(input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", input.display()))?;
    let def = executable::unpack(&bytes)
        .into_diagnostic()
        .wrap_err_with(|| format!("{} is not a valid executable", input.display()))?;

    println!(
        "{}: version {}, {} payload bytes",
        input.display(),
        executable::VERSION,
        bytes.len() - HEADER_LEN
    );
    println!("entry points:");
    for (ordinal, name) in def.entry_points.iter().enumerate() {
        match def.workgroup_sizes.get(ordinal) {
            Some(size) => println!("  {ordinal}: {name} [{}, {}, {}]", size.x, size.y, size.z),
            None => println!("  {ordinal}: {name}"),
        }
    }
    println!("code: {} words", def.code.len());
    if let Some(layout) = &def.pipeline_layout {
        println!("buffer binding set: {}", layout.buffer_binding_set);
        for (set, set_layout) in layout.descriptor_set_layouts.iter().enumerate() {
            let bindings: Vec<String> = set_layout
                .bindings
                .iter()
                .map(|b| b.binding.to_string())
                .collect();
            println!("  set {set}: bindings [{}]", bindings.join(", "));
        }
    }

    if let Some(path) = output {
        std::fs::write(path, def.code_bytes())
            .into_diagnostic()
            .wrap_err_with(|| format!("failed to write {}", path.display()))?;
    }
    Ok(())
}
