// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgEnum, Parser, Subcommand};
use termcolor::{ColorChoice, StandardStream};

use stack_depth_analyzer::error::AnalysisError;
use stack_depth_analyzer::report::Report;
use stack_depth_analyzer::AnalysisContext;

#[derive(Debug, Clone, Copy, ArgEnum)]
enum Arch {
    #[clap(name = "elf-arm-thumbv6m-cortex-m0")]
    ElfArmThumbv6mCortexM0,
}

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "static worst-case stack-depth analysis for Thumbv6-m binaries")]
struct Cli {
    /// Target architecture/ABI. Only one is implemented today; the
    /// argument exists so a future decoder can be selected the same way.
    #[clap(arg_enum)]
    arch: Arch,

    #[clap(subcommand)]
    command: Command,

    /// Increase diagnostic verbosity (repeatable: -v, -vv).
    #[clap(short, long, parse(from_occurrences), global = true)]
    verbose: u8,

    /// Disable colored output, regardless of terminal support.
    #[clap(long, global = true)]
    no_color: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the per-entrypoint table and the global worst case.
    Summary {
        binary_path: PathBuf,
        config_path: Option<PathBuf>,
        /// Emit the report as JSON instead of a colored table.
        #[clap(long)]
        json: bool,
    },
    /// Print the worst-case witness call chain for one entrypoint.
    Chain {
        binary_path: PathBuf,
        entrypoint: String,
        config_path: Option<PathBuf>,
    },
    /// Print the crate version.
    Version,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:?}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let Arch::ElfArmThumbv6mCortexM0 = cli.arch;

    match &cli.command {
        Command::Version => {
            println!("stack-depth-analyzer {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
        Command::Summary {
            binary_path,
            config_path,
            json,
        } => summary(cli, binary_path, config_path.as_deref(), *json),
        Command::Chain {
            binary_path,
            entrypoint,
            config_path,
        } => chain(cli, binary_path, config_path.as_deref(), entrypoint),
    }
}

fn build_context(
    cli: &Cli,
    binary_path: &std::path::Path,
    config_path: Option<&std::path::Path>,
) -> Result<AnalysisContext, AnalysisError> {
    if cli.verbose >= 1 {
        eprintln!("note: loading {}", binary_path.display());
    }
    AnalysisContext::build(binary_path, config_path)
}

fn summary(
    cli: &Cli,
    binary_path: &std::path::Path,
    config_path: Option<&std::path::Path>,
    json: bool,
) -> Result<ExitCode> {
    let ctx = match build_context(cli, binary_path, config_path) {
        Ok(ctx) => ctx,
        Err(e) => return Ok(fail(&e)),
    };
    if cli.verbose >= 2 {
        eprintln!(
            "note: {} functions analyzed, {} carry a fatal tag",
            ctx.functions.len(),
            ctx.fatal.len()
        );
    }

    let results = ctx.analyze();
    let any_failed = results.iter().any(|(_, r)| r.is_err());
    let report = Report::build(&results);

    if json {
        println!("{}", serde_json::to_string_pretty(&report.to_json())?);
    } else {
        let choice = if cli.no_color {
            ColorChoice::Never
        } else {
            ColorChoice::Auto
        };
        let mut out = StandardStream::stdout(choice);
        report
            .write_text(&mut out)
            .context("writing report to stdout")?;
    }

    Ok(if any_failed {
        ExitCode::from(3)
    } else {
        ExitCode::SUCCESS
    })
}

fn chain(
    cli: &Cli,
    binary_path: &std::path::Path,
    config_path: Option<&std::path::Path>,
    entrypoint: &str,
) -> Result<ExitCode> {
    let ctx = match build_context(cli, binary_path, config_path) {
        Ok(ctx) => ctx,
        Err(e) => return Ok(fail(&e)),
    };

    let results = ctx.analyze();
    let Some((ep, result)) = results.iter().find(|(e, _)| e.name == entrypoint)
    else {
        eprintln!("error: no such entrypoint `{entrypoint}`");
        return Ok(ExitCode::from(2));
    };

    match result {
        Ok(r) => {
            println!("{} (vector {}):", ep.name, ep.vector_index);
            for step in &r.witness {
                println!("  {} (+{})", step.function, step.depth_at_call);
            }
            println!("total: {}", r.total_depth);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => Ok(fail(e)),
    }
}

fn fail(e: &AnalysisError) -> ExitCode {
    eprintln!("error: {e}");
    ExitCode::from(e.exit_code() as u8)
}
