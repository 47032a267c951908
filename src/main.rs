//! `fzxfs` mounts an XFS block device or image file as a FUSE filesystem.
//!
//! Mounts are read-only unless `-w` is given. The probe options (`-p`,
//! `-L`, `-U`) validate the superblock and print volume information
//! without mounting.

use std::env;
use std::path::PathBuf;
use std::process::exit;

use fuser::MountOption;
use fzxfs::fs::xfs::XfsFs;
use fzxfs::fuse::XfsFuse;
use fzxfs::io::device::BlockDevice;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
    /// The name of the current program used in command line.
    prog: String,

    /// If true, print command line help.
    help: bool,
    /// Mount read-write instead of the default read-only.
    read_write: bool,
    /// Validate the filesystem and exit without mounting.
    probe_only: bool,
    /// Print the volume label and exit.
    print_label: bool,
    /// Print the volume UUID and exit.
    print_uuid: bool,

    /// The device or image file.
    device: Option<PathBuf>,
    /// The mount point.
    mountpoint: Option<PathBuf>,
}

impl Args {
    /// Tells whether arguments are valid.
    fn is_valid(&self) -> bool {
        if self.help {
            return true;
        }
        if self.device.is_none() {
            return false;
        }
        if self.probe_only || self.print_label || self.print_uuid {
            return true;
        }
        self.mountpoint.is_some()
    }
}

fn parse_args() -> Args {
    let mut args: Args = Default::default();

    let mut iter = env::args();
    args.prog = iter.next().unwrap_or("fzxfs".to_owned());

    for arg in iter {
        match arg.as_str() {
            "-h" | "--help" => args.help = true,
            "-w" | "--read-write" => args.read_write = true,
            "-p" | "--probe" => args.probe_only = true,
            "-L" | "--label" => args.print_label = true,
            "-U" | "--uuid" => args.print_uuid = true,

            _ => {
                if args.device.is_none() {
                    args.device = Some(arg.into());
                } else if args.mountpoint.is_none() {
                    args.mountpoint = Some(arg.into());
                } else {
                    args.help = true;
                }
            }
        }
    }

    args
}

/// Prints command usage.
///
/// `prog` is the name of the current program.
fn print_usage(prog: &str) {
    eprintln!("{prog}: bad usage");
    eprintln!("Try '{prog} --help' for more information.");
}

/// Prints command help.
fn print_help(prog: &str) {
    println!("Usage:");
    println!(" {prog} [options] <device> <mountpoint>");
    println!();
    println!("Mounts an XFS filesystem through FUSE (read-only by default).");
    println!();
    println!("Options:");
    println!(" -w, --read-write  mount read-write");
    println!(" -p, --probe       validate the filesystem, do not mount");
    println!(" -L, --label       print the volume label, do not mount");
    println!(" -U, --uuid        print the volume UUID, do not mount");
    println!(" -h, --help        print this help");
}

fn main() {
    env_logger::init();

    let args = parse_args();
    if args.help {
        print_help(&args.prog);
        exit(0);
    }
    if !args.is_valid() {
        print_usage(&args.prog);
        exit(1);
    }

    let device_path = args.device.unwrap();
    let read_only = !args.read_write;

    let dev = match BlockDevice::open(&device_path, read_only) {
        Ok(dev) => dev,
        Err(err) => {
            eprintln!("{}: cannot open {}: {err}", args.prog, device_path.display());
            exit(1);
        }
    };
    let fs = match XfsFs::mount(dev, read_only) {
        Ok(fs) => fs,
        Err(err) => {
            eprintln!("{}: {}: {err}", args.prog, device_path.display());
            exit(1);
        }
    };

    if args.print_label {
        println!("{}", fs.label());
    }
    if args.print_uuid {
        println!("{}", fs.uuid());
    }
    if args.probe_only || args.print_label || args.print_uuid {
        exit(0);
    }

    let mountpoint = args.mountpoint.unwrap();
    let mut options = vec![
        MountOption::FSName("fzxfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if read_only {
        options.push(MountOption::RO);
    }

    match fuser::mount2(XfsFuse::new(fs), &mountpoint, &options) {
        Ok(()) => exit(0),
        Err(err) => {
            eprintln!("{}: mount failed: {err}", args.prog);
            exit(1);
        }
    }
}
