//! The `gfs2fsck` tool checks and repairs a clustered journaled
//! filesystem on a block device.

use gfs2fsck::fsck;
use gfs2fsck::fsck::FsckCtx;
use gfs2fsck::fsck::Options;
use gfs2fsck::initialize;
use gfs2fsck::log;
use gfs2fsck::log_err;
use gfs2fsck::log_notice;
use gfs2fsck::pass1::pass1;
use gfs2fsck::pass1b::pass1b;
use gfs2fsck::pass1c::pass1c;
use gfs2fsck::pass2::pass2;
use gfs2fsck::pass3::pass3;
use gfs2fsck::pass4::pass4;
use gfs2fsck::pass5::pass5;
use gfs2fsck::FsckError;
use std::env;
use std::path::PathBuf;
use std::process::exit;

/// The tool's version.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// If true, print command line help.
	help: bool,
	/// If true, print the version and exit.
	version: bool,
	/// Answer yes to every question.
	yes: bool,
	/// Answer no to every question.
	no: bool,
	/// Verbosity delta from -q and -v.
	verbosity: i32,

	/// The path to the device holding the filesystem.
	device_path: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
	let mut args: Args = Default::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or("gfs2fsck".to_owned());

	for arg in iter {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"-V" | "--version" => args.version = true,
			"-y" => args.yes = true,
			"-n" => args.no = true,
			"-q" => args.verbosity -= 1,
			"-v" => args.verbosity += 1,

			_ if arg.starts_with('-') => {
				return Err(format!("invalid option -- '{}'", arg));
			}
			_ => {
				if args.device_path.is_some() {
					return Err("more than one device given".to_owned());
				}
				args.device_path = Some(PathBuf::from(arg));
			}
		}
	}

	if args.yes && args.no {
		return Err("-y and -n are mutually exclusive".to_owned());
	}
	Ok(args)
}

/// Prints the command's usage.
fn print_usage(prog: &str) {
	eprintln!("Usage: {} [-hnqvVy] <device>", prog);
	eprintln!();
	eprintln!("Options:");
	eprintln!(" -h:\t\tprints usage");
	eprintln!(" -V:\t\tprints version");
	eprintln!(" -n:\t\tanswers no to every question (read-only check)");
	eprintln!(" -y:\t\tanswers yes to every question");
	eprintln!(" -q:\t\tdecreases verbosity");
	eprintln!(" -v:\t\tincreases verbosity");
}

/// The passes, in their fixed order.
const PASSES: [(&str, fn(&mut FsckCtx) -> Result<(), FsckError>); 7] = [
	("pass1", pass1),
	("pass1b", pass1b),
	("pass1c", pass1c),
	("pass2", pass2),
	("pass3", pass3),
	("pass4", pass4),
	("pass5", pass5),
];

fn run(ctx: &mut FsckCtx) -> Result<(), FsckError> {
	for (name, pass) in PASSES {
		log_notice!("Starting {}", name);
		ctx.poll_interrupt()?;
		pass(ctx)?;
		// Each pass leaves a consistent state on disk
		ctx.sdp.bcache.flush()?;
		log_notice!("{} completed", name);
	}
	Ok(())
}

fn main() {
	let args = match parse_args() {
		Ok(args) => args,
		Err(msg) => {
			let prog = env::args().next().unwrap_or("gfs2fsck".to_owned());
			eprintln!("{}: {}", prog, msg);
			print_usage(&prog);
			exit(fsck::FSCK_USAGE);
		}
	};

	if args.help {
		print_usage(&args.prog);
		exit(fsck::FSCK_OK);
	}
	if args.version {
		println!("{} {}", args.prog, VERSION);
		exit(fsck::FSCK_OK);
	}

	let Some(device_path) = args.device_path else {
		eprintln!("{}: specify path to a device", args.prog);
		print_usage(&args.prog);
		exit(fsck::FSCK_USAGE);
	};

	log::set_verbosity(args.verbosity);
	fsck::install_interrupt_handler();

	let opts = Options {
		yes: args.yes,
		no: args.no,
	};
	let mut ctx = match initialize::initialize(&device_path, opts) {
		Ok(ctx) => ctx,
		Err(e) => {
			eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
			exit(error_code(&e));
		}
	};

	let result = run(&mut ctx);
	if let Err(e) = initialize::destroy(&mut ctx) {
		eprintln!("{}: {}", args.prog, e);
		exit(fsck::FSCK_ERROR);
	}

	match result {
		Ok(()) => {}
		Err(e) => {
			log_err!("{}: {}", args.prog, e);
			exit(error_code(&e));
		}
	}

	let code = ctx.exit_code();
	match code {
		fsck::FSCK_OK => log_notice!("The filesystem is clean."),
		fsck::FSCK_NONDESTRUCT => {
			log_notice!(
				"The filesystem was repaired: {} errors found, {} corrected; complete.",
				ctx.errors_found,
				ctx.errors_corrected
			);
		}
		_ => {
			log_err!(
				"{} errors found, only {} corrected. Cannot continue.",
				ctx.errors_found,
				ctx.errors_corrected
			);
		}
	}
	exit(code);
}

/// Maps a fatal error to its exit code.
fn error_code(e: &FsckError) -> i32 {
	match e {
		FsckError::Canceled => fsck::FSCK_CANCELED,
		_ => fsck::FSCK_ERROR,
	}
}
