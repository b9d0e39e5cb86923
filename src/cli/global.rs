use std::io::IsTerminal;

use clap::{Args, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Auto,
    Never,
    Always,
}

impl Mode {
    pub fn enabled(self, is_terminal: bool) -> bool {
        match self {
            Mode::Auto => is_terminal,
            Mode::Never => false,
            Mode::Always => true,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// Enable verbose output; repeat for more detail
    #[arg(global = true, long, short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress everything except hits and errors
    #[arg(global = true, long, short)]
    pub quiet: bool,

    /// When to use colored output
    #[arg(global = true, long, value_enum, default_value_t = Mode::Auto, value_name = "MODE")]
    pub color: Mode,

    /// When to show enumeration progress
    #[arg(global = true, long, value_enum, default_value_t = Mode::Auto, value_name = "MODE")]
    pub progress: Mode,

    /// Do not inherit HTTP_PROXY/HTTPS_PROXY from the environment
    #[arg(global = true, long)]
    pub ignore_proxy: bool,
}

impl GlobalArgs {
    pub fn use_color(&self) -> bool {
        !self.quiet && self.color.enabled(std::io::stderr().is_terminal())
    }

    pub fn use_progress(&self) -> bool {
        !self.quiet && self.progress.enabled(std::io::stderr().is_terminal())
    }

    /// Default tracing filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "cormorant=error";
        }
        match self.verbose {
            0 => "cormorant=info",
            1 => "cormorant=debug",
            _ => "cormorant=trace",
        }
    }
}
