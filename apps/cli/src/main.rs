use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bbflash_core::image::{Image, ImageKind};
use bbflash_core::{
    CancelToken, ObserverHandle, TracingObserver, UpdateConfig, UpdateOutcome, UpdateSession,
};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Baseband modem firmware updater", long_about = None)]
struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Trace every packet on the wire (with -vv)
    #[arg(long, global = true)]
    packets: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Flash firmware images
    Update(UpdateArgs),
    /// Reboot the modem into download mode
    Reset(DeviceArgs),
    /// Show what the updater sees in firmware files
    Inspect {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
struct DeviceArgs {
    /// Download-mode tty
    #[arg(long)]
    tty: Option<PathBuf>,

    /// Control port of the modem in normal mode
    #[arg(long)]
    cdc_wdm: Option<PathBuf>,

    /// USB vendor id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// USB product id (hex)
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    #[arg(long)]
    busnum: Option<u8>,

    #[arg(long)]
    devnum: Option<u8>,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Firmware files (.cwe, .nvu, .spk or *.mbn)
    images: Vec<PathBuf>,

    /// TOML file with update settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Write the effective settings to a TOML file and exit
    #[arg(long)]
    save_config: Option<PathBuf>,

    #[command(flatten)]
    device: DeviceArgs,

    /// Expected firmware version
    #[arg(short = 'f', long)]
    firmware_version: Option<String>,

    /// Expected config version
    #[arg(short = 'c', long)]
    config_version: Option<String>,

    /// Expected carrier
    #[arg(short = 'C', long)]
    carrier: Option<String>,

    #[arg(long)]
    ignore_version_errors: bool,

    /// Download even if the modem reports it has the images
    #[arg(long)]
    override_download: bool,

    #[arg(long)]
    skip_validation: bool,

    #[arg(long)]
    modem_storage_index: Option<u8>,
}

fn parse_hex_u16(s: &str) -> Result<u16, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid hex id {s:?}: {e}"))
}

/// Ctrl-C asks the running session to stop at the next step boundary.
fn install_cancel_handler() -> Result<CancelToken> {
    let token = CancelToken::new();
    ctrlc::set_handler({
        let token = token.clone();
        move || token.cancel()
    })
    .context("couldn't install Ctrl-C handler")?;
    Ok(token)
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let observer: ObserverHandle = Arc::new(TracingObserver::with_packets(cli.packets));
    let result = match cli.command {
        Commands::Update(args) => update(args, observer),
        Commands::Reset(args) => reset(args, observer),
        Commands::Inspect { files } => inspect(&files),
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn apply_device_args(config: &mut UpdateConfig, args: DeviceArgs) {
    config.tty = args.tty.or(config.tty.take());
    config.cdc_wdm = args.cdc_wdm.or(config.cdc_wdm.take());
    config.vid = args.vid.or(config.vid);
    config.pid = args.pid.or(config.pid);
    config.busnum = args.busnum.or(config.busnum);
    config.devnum = args.devnum.or(config.devnum);
}

fn update(args: UpdateArgs, observer: ObserverHandle) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => UpdateConfig::load_from_file(path)
            .with_context(|| format!("couldn't load {}", path.display()))?,
        None => UpdateConfig::default(),
    };
    if !args.images.is_empty() {
        config.images = args.images;
    }
    apply_device_args(&mut config, args.device);
    config.firmware_version = args.firmware_version.or(config.firmware_version);
    config.config_version = args.config_version.or(config.config_version);
    config.carrier = args.carrier.or(config.carrier);
    config.ignore_version_errors |= args.ignore_version_errors;
    config.override_download |= args.override_download;
    config.skip_validation |= args.skip_validation;
    config.modem_storage_index = args.modem_storage_index.or(config.modem_storage_index);

    if let Some(path) = &args.save_config {
        config
            .save_to_file(path)
            .with_context(|| format!("couldn't write {}", path.display()))?;
        info!(path = %path.display(), "Configuration saved");
        return Ok(());
    }
    if config.images.is_empty() {
        bail!("no firmware images given");
    }

    let mut session = UpdateSession::new(config)
        .with_observer(observer)
        .with_cancel(install_cancel_handler()?);
    match session.run()? {
        UpdateOutcome::Updated(report) => {
            if report.before.is_some() {
                print!("{}", report.render());
            }
            println!("firmware update finished");
        }
        UpdateOutcome::NoDownloadNeeded => println!("modem already runs the requested firmware"),
    }
    Ok(())
}

fn reset(args: DeviceArgs, observer: ObserverHandle) -> Result<()> {
    let mut config = UpdateConfig::default();
    apply_device_args(&mut config, args);
    let mut session = UpdateSession::new(config)
        .with_observer(observer)
        .with_cancel(install_cancel_handler()?);
    let tty = session.reset_to_download_mode()?;
    println!("modem in download mode at {}", tty.display());
    Ok(())
}

fn inspect(files: &[PathBuf]) -> Result<()> {
    for path in files {
        inspect_one(path).with_context(|| format!("couldn't inspect {}", path.display()))?;
    }
    Ok(())
}

fn inspect_one(path: &Path) -> Result<()> {
    let image = Image::open(path, true)?;
    println!("{}", image.display_name());
    println!("  type:        {}", image.image_type());
    println!("  size:        {}", image.size());
    println!("  header size: {}", image.header_size());
    println!("  data size:   {}", image.data_size());
    println!("  chunks:      {} x {}", image.n_chunks(), image.chunk_size());
    if let ImageKind::Cwe(info) = image.kind() {
        let show = |v: Option<&str>| v.unwrap_or("unknown").to_string();
        println!("  firmware:    {}", show(image.firmware_version()));
        println!("  config:      {}", show(image.config_version()));
        println!("  carrier:     {}", show(image.carrier()));
        for line in info.tree_text().lines() {
            println!("  {line}");
        }
    }
    Ok(())
}
