//! # pinctl CLI
//!
//! Drives ioctl calls against a device node from the shell.
//!
//! ## Commands
//!
//! - `pinctl info` - Show word size, byte order and scratch limits
//! - `pinctl ioctl <CMD> [VALUE]` - Scalar ioctl
//! - `pinctl call <CMD> <HEX> --reloc HOLE:TARGET` - Structured ioctl
//! - `pinctl dump <LEN>` - Hex dump of mapped device memory

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use pinctl_config::Config;
use pinctl_ioctl::{
    Access, ByteOrder, DeviceFile, OffsetTable, Payload, StableBuf, SCRATCH_CAPACITY,
    STABLE_ALIGN, WORD_SIZE,
};

/// pinctl - structured ioctl calls from the command line
#[derive(Parser)]
#[command(name = "pinctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Device node (default: `device.path` from the config file)
    #[arg(short, long, global = true, env = "PINCTL_DEVICE")]
    device: Option<PathBuf>,

    /// Log filter, overrides `log.level` from the config file
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show platform facts the marshaller relies on
    Info,

    /// Issue a scalar ioctl
    Ioctl {
        /// Request code, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_command)]
        command: u64,

        /// Integer argument
        #[arg(default_value_t = 0, allow_hyphen_values = true)]
        value: i32,
    },

    /// Issue a structured ioctl and print the driver's response
    Call {
        /// Request code, decimal or 0x-prefixed hex
        #[arg(value_parser = parse_command)]
        command: u64,

        /// Struct image as hex bytes
        #[arg(value_name = "HEX")]
        payload: String,

        /// Pointer relocation, repeatable
        #[arg(short, long = "reloc", value_name = "HOLE:TARGET", value_parser = parse_reloc)]
        relocations: Vec<(isize, isize)>,

        /// Pass the payload in a stable buffer instead of staging it
        #[arg(long)]
        stable: bool,
    },

    /// Map device memory and hex dump it
    Dump {
        /// Number of bytes to map
        #[arg(value_parser = parse_number)]
        len: u64,

        /// Byte offset into the device
        #[arg(short, long, default_value = "0", value_parser = parse_number)]
        offset: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::global().context("Failed to load config")?;

    let mut log = config.log.clone();
    if let Some(level) = cli.log.clone() {
        log.level = level;
    }
    pinctl_config::init_logging(&log);

    match cli.command {
        Commands::Info => cmd_info(config),
        Commands::Ioctl { command, value } => {
            let dev = open_device(cli.device.as_deref(), config)?;
            cmd_ioctl(&dev, command, value)
        }
        Commands::Call {
            command,
            payload,
            relocations,
            stable,
        } => {
            let dev = open_device(cli.device.as_deref(), config)?;
            cmd_call(&dev, command, &payload, &relocations, stable)
        }
        Commands::Dump { len, offset } => {
            let dev = open_device(cli.device.as_deref(), config)?;
            cmd_dump(&dev, len, offset)
        }
    }
}

fn open_device(explicit: Option<&Path>, config: &Config) -> Result<DeviceFile> {
    let path = explicit
        .or(config.device.path.as_deref())
        .context("No device given; pass --device or set device.path in the config file")?;
    let access = if config.device.read_only {
        Access::ReadOnly
    } else {
        Access::ReadWrite
    };
    DeviceFile::open(path, access)
        .with_context(|| format!("Failed to open device {}", path.display()))
}

/// Print the constants a caller needs to lay out struct images
fn cmd_info(config: &Config) -> Result<()> {
    println!("word size:        {} bytes", WORD_SIZE);
    println!("byte order:       {}", ByteOrder::NATIVE);
    println!("scratch capacity: {} bytes", SCRATCH_CAPACITY);
    println!("stable alignment: {} bytes", STABLE_ALIGN);
    match pinctl_config::resolve_path(std::env::var_os(pinctl_config::CONFIG_ENV).map(PathBuf::from)) {
        Some(path) => println!("config file:      {}", path.display()),
        None => println!("config file:      (none)"),
    }
    if let Some(device) = &config.device.path {
        println!("default device:   {}", device.display());
    }
    Ok(())
}

fn cmd_ioctl(dev: &DeviceFile, command: u64, value: i32) -> Result<()> {
    debug!(path = %dev.path().display(), command, value, "Scalar ioctl");
    // Safety: the operator vouches for the request code and argument.
    let rc = unsafe { dev.ioctl(command, value) }
        .with_context(|| format!("ioctl {:#x} on {}", command, dev.path().display()))?;
    println!("{}", rc);
    Ok(())
}

fn cmd_call(
    dev: &DeviceFile,
    command: u64,
    payload_hex: &str,
    relocations: &[(isize, isize)],
    stable: bool,
) -> Result<()> {
    let mut data = hex::decode(payload_hex.trim()).context("Payload is not valid hex")?;
    let table: Vec<isize> = relocations
        .iter()
        .flat_map(|&(hole, target)| [hole, target])
        .collect();
    debug!(
        path = %dev.path().display(),
        command,
        len = data.len(),
        pairs = relocations.len(),
        stable,
        "Structured ioctl"
    );

    // Safety: the operator vouches that the request code matches the image.
    let (rc, response) = if stable {
        let mut buf = StableBuf::from_slice(&data);
        let rc = unsafe {
            dev.ioctl_structured(command, Payload::stable(&mut buf), OffsetTable::new(&table))
        };
        (rc, buf.to_vec())
    } else {
        let rc = unsafe {
            dev.ioctl_structured(command, Payload::staged(&mut data), OffsetTable::new(&table))
        };
        (rc, data)
    };
    let rc = rc.with_context(|| format!("ioctl {:#x} on {}", command, dev.path().display()))?;

    println!("result:   {}", rc);
    println!("response: {}", hex::encode(response));
    Ok(())
}

/// Dump through a read-only mapping, so read-only devices work too
fn cmd_dump(dev: &DeviceFile, len: u64, offset: u64) -> Result<()> {
    let len = usize::try_from(len).context("Length does not fit in memory")?;
    let map = dev
        .map_read_only(len, offset)
        .with_context(|| format!("Failed to map {} bytes of {}", len, dev.path().display()))?;

    for (i, line) in map.chunks(16).enumerate() {
        println!("{:08x}  {}", offset + (i * 16) as u64, hex::encode(line));
    }
    Ok(())
}

/// Parse a decimal or `0x`-prefixed hex number
fn parse_number(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(digits) => u64::from_str_radix(&digits.replace('_', ""), 16),
        None => s.replace('_', "").parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", s, e))
}

/// Request codes are at most 32 bits wide
fn parse_command(s: &str) -> Result<u64, String> {
    let value = parse_number(s)?;
    if value > u64::from(u32::MAX) {
        return Err(format!("request code {:#x} does not fit in 32 bits", value));
    }
    Ok(value)
}

fn parse_reloc(s: &str) -> Result<(isize, isize), String> {
    let (hole, target) = s
        .split_once(':')
        .ok_or_else(|| format!("expected HOLE:TARGET, got '{}'", s))?;
    let parse = |part: &str| {
        parse_number(part)
            .ok()
            .and_then(|n| isize::try_from(n).ok())
            .ok_or_else(|| format!("invalid offset '{}'", part))
    };
    Ok((parse(hole)?, parse(target)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("42"), Ok(42));
        assert_eq!(parse_number("0x6b01"), Ok(0x6b01));
        assert_eq!(parse_number("0X4020_6B00"), Ok(0x4020_6b00));
        assert!(parse_number("0xzz").is_err());
        assert!(parse_number("-1").is_err());
    }

    #[test]
    fn test_parse_command_width() {
        assert_eq!(parse_command("0xc0685600"), Ok(0xc068_5600));
        assert!(parse_command("0x1_0000_0000").is_err());
    }

    #[test]
    fn test_parse_reloc() {
        assert_eq!(parse_reloc("0:32"), Ok((0, 32)));
        assert_eq!(parse_reloc("0x8:0x10"), Ok((8, 16)));
        assert!(parse_reloc("8").is_err());
        assert!(parse_reloc("8:x").is_err());
    }

    #[test]
    fn test_call_arguments() {
        let cli = Cli::try_parse_from([
            "pinctl", "--device", "/dev/spidev0.0", "call", "0x40206b00", "00112233", "-r", "0:32",
            "--reloc", "8:40",
        ])
        .unwrap();
        assert_eq!(cli.device, Some(PathBuf::from("/dev/spidev0.0")));
        match cli.command {
            Commands::Call {
                command,
                payload,
                relocations,
                stable,
            } => {
                assert_eq!(command, 0x4020_6b00);
                assert_eq!(payload, "00112233");
                assert_eq!(relocations, vec![(0, 32), (8, 40)]);
                assert!(!stable);
            }
            _ => panic!("expected call"),
        }
    }

    #[test]
    fn test_dump_read_only_device() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(&[0xab; 48]).unwrap();
        temp.flush().unwrap();

        let mut config = Config::default();
        config.device.read_only = true;
        let dev = open_device(Some(temp.path()), &config).unwrap();
        cmd_dump(&dev, 48, 0).unwrap();
    }

    #[test]
    fn test_open_device_requires_a_path() {
        let err = open_device(None, &Config::default()).unwrap_err();
        assert!(err.to_string().contains("No device given"));
    }
}
