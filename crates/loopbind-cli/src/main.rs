//! losetup-style command line driver over `loopbind-core`.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use log::{info, warn};
use loopbind_core::{
    bind, find_free, is_associated, logging, query_status, unbind, Association, BindRequest,
    BindingStatus, DeviceTopology, FdReader, FileIdentity, FilterMode, LoopError, LoopSearch,
    PassphraseSource, TerminalPrompt,
};
use std::path::{Path, PathBuf};

/// Set up and control loop devices.
#[derive(Parser, Debug)]
#[command(
    name = "loopbind",
    version,
    about = "Set up and control loop devices.",
    after_help = "With no flags and a single device argument, prints the device's binding.\n\
                  With a device and a file (or --find and a file), sets up a binding."
)]
struct Cli {
    /// List all used loop devices.
    #[arg(short = 'a', long = "all")]
    all: bool,

    /// Detach the given loop device(s).
    #[arg(short = 'd', long = "detach")]
    detach: bool,

    /// Enable data encryption with the given cipher name or number.
    #[arg(short = 'e', long = "encryption", value_name = "TYPE")]
    encryption: Option<String>,

    /// Find the first unused loop device.
    #[arg(short = 'f', long = "find")]
    find: bool,

    /// List the devices associated with the given file.
    #[arg(short = 'j', long = "associated", value_name = "FILE")]
    associated: Option<PathBuf>,

    /// Number of bits of the hashed key to hand to the cipher.
    #[arg(short = 'k', long = "keybits", value_name = "NUM")]
    keybits: Option<u32>,

    /// Do not hash the passphrase.
    #[arg(short = 'N', long = "nohashpass")]
    no_hash_pass: bool,

    /// Start at the given byte offset into the file.
    #[arg(short = 'o', long = "offset", value_name = "NUM")]
    offset: Option<u64>,

    /// Limit the loop device to this many bytes of the file.
    #[arg(long = "sizelimit", value_name = "NUM")]
    sizelimit: Option<u64>,

    /// Read the passphrase from this file descriptor instead of the terminal.
    #[arg(short = 'p', long = "pass-fd", value_name = "FD")]
    pass_fd: Option<i32>,

    /// Set up a read-only loop device.
    #[arg(short = 'r', long = "read-only")]
    read_only: bool,

    /// Print the device name (with --find <file>).
    #[arg(short = 's', long = "show")]
    show: bool,

    /// Increase verbosity (repeatable).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,

    /// Loop device and/or backing file, depending on the mode.
    #[arg(value_name = "ARGS")]
    args: Vec<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let topology = DeviceTopology::default();

    if cli.all {
        return list_used(&topology);
    }
    if let Some(file) = &cli.associated {
        return list_associated(&topology, file, cli.offset);
    }
    if cli.detach {
        if cli.args.is_empty() {
            bail!("--detach needs at least one loop device");
        }
        for device in &cli.args {
            unbind(device).with_context(|| format!("cannot detach {}", device.display()))?;
        }
        return Ok(());
    }

    // Remaining modes: find and/or setup and/or show a single device.
    let (device, file) = resolve_positionals(&cli, &topology)?;

    match file {
        None => show_device(&device),
        Some(file) => setup(&cli, &topology, device, &file),
    }
}

/// Work out which positional is the device and which the backing file,
/// consulting --find when no device was given.
fn resolve_positionals(cli: &Cli, topology: &DeviceTopology) -> Result<(PathBuf, Option<PathBuf>)> {
    if cli.find {
        if cli.args.len() > 1 {
            bail!("--find takes at most one file argument");
        }
        let device = find_free(topology).context("no usable loop device")?;
        let path = device.path.clone();
        drop(device);
        if cli.args.is_empty() {
            info!("loop device is {}", path.display());
            println!("{}", path.display());
            std::process::exit(0);
        }
        return Ok((path, Some(cli.args[0].clone())));
    }

    match cli.args.as_slice() {
        [device] => Ok((device.clone(), None)),
        [device, file] => Ok((device.clone(), Some(file.clone()))),
        _ => bail!("expected a loop device (and optionally a file); see --help"),
    }
}

fn setup(cli: &Cli, topology: &DeviceTopology, mut device: PathBuf, file: &Path) -> Result<()> {
    let mut source: Box<dyn PassphraseSource> = match cli.pass_fd {
        Some(fd) => Box::new(FdReader::new(fd)),
        None => Box::new(TerminalPrompt),
    };

    loop {
        let request = BindRequest {
            device: &device,
            file,
            offset: cli.offset.unwrap_or(0),
            size_limit: cli.sizelimit.unwrap_or(0),
            cipher: cli.encryption.as_deref(),
            key_bits: cli.keybits,
            stretch_key: !cli.no_hash_pass,
            read_only: cli.read_only,
            autoclear: false,
            topology: Some(topology),
        };

        match bind(&request, source.as_mut()) {
            Ok(report) => {
                if report.read_only && !cli.read_only {
                    info!(
                        "{}: backing filesystem is read-only, binding downgraded",
                        device.display()
                    );
                }
                info!("loop device is {}", device.display());
                if cli.show && cli.find {
                    println!("{}", device.display());
                }
                return Ok(());
            }
            // Someone stole the device between enumeration and attach;
            // with --find we can simply pick another one and go again.
            Err(LoopError::Busy { device: stolen }) if cli.find => {
                warn!("{} was stolen, trying another device", stolen.display());
                device = find_free(topology)
                    .context("no usable loop device")?
                    .path;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("cannot set up {}", device.display()))
            }
        }
    }
}

fn show_device(device: &Path) -> Result<()> {
    let file = std::fs::File::open(device)
        .with_context(|| format!("cannot open {}", device.display()))?;
    match query_status(&file)
        .with_context(|| format!("cannot get info on {}", device.display()))?
    {
        Some(status) => {
            println!("{}", format_status(device, &status));
            Ok(())
        }
        None => bail!("{}: no backing file attached", device.display()),
    }
}

fn list_used(topology: &DeviceTopology) -> Result<()> {
    let mut search = LoopSearch::open(topology, FilterMode::UsedOnly)
        .context("cannot enumerate loop devices")?;

    for device in &mut search {
        if let Ok(Some(status)) = query_status(&device.file) {
            println!("{}", format_status(&device.path, &status));
        }
    }

    let counters = search.counters();
    if counters.attempted > 0 && counters.permission_denied > 0 {
        bail!("no permission to look at some loop devices");
    }
    Ok(())
}

fn list_associated(topology: &DeviceTopology, file: &Path, offset: Option<u64>) -> Result<()> {
    let target = FileIdentity::of(file)
        .with_context(|| format!("cannot stat {}", file.display()))?;
    let offset_significant = offset.is_some();
    let offset = offset.unwrap_or(0);

    let search = LoopSearch::open(topology, FilterMode::UsedOnly)
        .context("cannot enumerate loop devices")?;
    for device in search {
        if is_associated(&device.file, target, offset, offset_significant) == Association::Bound {
            if let Ok(Some(status)) = query_status(&device.file) {
                println!("{}", format_status(&device.path, &status));
            }
        }
    }
    Ok(())
}

fn format_status(device: &Path, status: &BindingStatus) -> String {
    let mut line = format!(
        "{}: [{:04x}]:{} ({})",
        device.display(),
        status.backing_dev,
        status.backing_ino,
        status.file_name
    );
    if status.offset != 0 {
        line.push_str(&format!(", offset {}", status.offset));
    }
    if status.size_limit != 0 {
        line.push_str(&format!(", sizelimit {}", status.size_limit));
    }
    if status.encrypt_type != 0 || !status.crypt_name.is_empty() {
        let name = if status.crypt_name.is_empty() && status.encrypt_type == 1 {
            "XOR"
        } else {
            &status.crypt_name
        };
        line.push_str(&format!(
            ", encryption {} (type {})",
            name, status.encrypt_type
        ));
    }
    line
}
