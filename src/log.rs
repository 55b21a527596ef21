//! Leveled message printing.
//!
//! Verbosity starts at 0 and is moved by the `-q` and `-v` command line
//! flags. Errors always print; notices print at 0 and above; informational
//! and debug messages need raised verbosity.

use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

static VERBOSITY: AtomicI32 = AtomicI32::new(0);

/// Sets the global verbosity level.
pub fn set_verbosity(level: i32) {
	VERBOSITY.store(level, Ordering::Relaxed);
}

/// Returns the global verbosity level.
pub fn verbosity() -> i32 {
	VERBOSITY.load(Ordering::Relaxed)
}

/// Prints an error message. Always shown.
#[macro_export]
macro_rules! log_err {
	($($arg:tt)*) => {
		eprintln!($($arg)*)
	};
}

/// Prints a notice. Shown unless `-q` was given.
#[macro_export]
macro_rules! log_notice {
	($($arg:tt)*) => {
		if $crate::log::verbosity() >= 0 {
			println!($($arg)*)
		}
	};
}

/// Prints an informational message. Needs `-v`.
#[macro_export]
macro_rules! log_info {
	($($arg:tt)*) => {
		if $crate::log::verbosity() >= 1 {
			println!($($arg)*)
		}
	};
}

/// Prints a debug message. Needs `-vv`.
#[macro_export]
macro_rules! log_debug {
	($($arg:tt)*) => {
		if $crate::log::verbosity() >= 2 {
			println!($($arg)*)
		}
	};
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn verbosity_levels() {
		set_verbosity(0);
		assert_eq!(verbosity(), 0);
		set_verbosity(-1);
		assert_eq!(verbosity(), -1);
		set_verbosity(2);
		assert_eq!(verbosity(), 2);
		set_verbosity(0);
	}
}
