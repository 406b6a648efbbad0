//! ESP Crash Decoder - Main Entry Point

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, EnvFilter};

use crash_decoder::config::{Args, OutputFormat};
use crash_decoder::params::{find_elf_path, find_tool_path};
use crash_decoder::{
    create_decode_params, decode, report, BoardInfo, Config, DecodeError, DecodeParams, TargetArch,
};

/// Exit status after Ctrl-C, as a shell reports SIGINT.
const EXIT_ABORTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    if args.generate_config {
        let config = Config::default();
        println!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    init_logging(&args)?;

    info!("Starting crash decoder v{}", env!("CARGO_PKG_VERSION"));
    debug!("Command line args: {:?}", args);

    let mut config = Config::load(args.config.as_ref()).inspect_err(|e| {
        error!("Failed to load configuration: {}", e);
    })?;
    config.merge_args(&args);

    if args.validate_config {
        config.validate()?;
        println!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    if args.show_config {
        println!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    config.validate().inspect_err(|e| {
        error!("Configuration validation failed: {}", e);
    })?;

    let input = read_input(&args.input).await?;
    let params = build_params(&args)?;
    info!(
        "Decoding for {} with {} and {}",
        params.target,
        params.tool_path.display(),
        params.elf_path.display()
    );

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling decode");
                cancel.cancel();
            }
        })
    };

    let options = config.decode_options(cancel);
    let outcome = decode(&params, &input, &options).await;
    ctrl_c.abort();

    let result = match outcome {
        Ok(result) => result,
        Err(e) if e.is_abort() => return Ok(ExitCode::from(EXIT_ABORTED)),
        Err(e) => return Err(e).context("Failed to decode panic output"),
    };

    match config.output.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print!("{}", report::render_text(&result)),
    }

    Ok(ExitCode::SUCCESS)
}

/// Initialize logging system
fn init_logging(args: &Args) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false);

    // stdout carries the decoded result, so logs never go there
    if let Some(log_file) = &args.log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file)
            .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

        subscriber.with_writer(file).init();
        eprintln!("Logging to file: {}", log_file.display());
    } else {
        subscriber.with_writer(std::io::stderr).init();
    }

    debug!("Logging initialized with level: {}", args.log_level);
    Ok(())
}

async fn read_input(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut input = String::new();
        tokio::io::stdin()
            .read_to_string(&mut input)
            .await
            .context("Failed to read panic output from stdin")?;
        return Ok(input);
    }
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read panic output from {}", path.display()))
}

/// Explicit `--tool`/`--elf` win; whatever is missing is discovered from the
/// board's build properties and build folder.
fn build_params(args: &Args) -> Result<DecodeParams> {
    let target_spec = args
        .target
        .as_deref()
        .context("--target is required (FQBN or chip name)")?;
    let build_properties: HashMap<String, String> = args.build_properties.iter().cloned().collect();

    if args.tool.is_none() && args.elf.is_none() {
        let board = BoardInfo {
            fqbn: target_spec.to_string(),
            build_properties,
            build_path: args.build_path.clone(),
            sketch_path: args.sketch_path.clone(),
        };
        return Ok(create_decode_params(&board)?);
    }

    let target: TargetArch = target_spec.parse()?;
    let sketch_path = args.sketch_path.clone().unwrap_or_default();

    let elf_path = match &args.elf {
        Some(elf) => elf.clone(),
        None => discover_elf(&sketch_path, args.build_path.as_deref())?,
    };
    let tool_path = match &args.tool {
        Some(tool) => tool.clone(),
        None => find_tool_path(&target, &build_properties)?,
    };

    Ok(DecodeParams {
        tool_path,
        elf_path,
        target,
        sketch_path,
    })
}

fn discover_elf(sketch_path: &Path, build_path: Option<&Path>) -> Result<PathBuf> {
    let build_path = build_path.context("--elf or --build-path is required")?;
    let sketch_name = sketch_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("--sketch-path is required to discover the ELF file")?;
    find_elf_path(&sketch_name, build_path).ok_or_else(|| {
        DecodeError::ElfNotFound(build_path.join(format!("{}.ino.elf", sketch_name))).into()
    })
}
