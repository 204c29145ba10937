mod cli;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::*;

use cli::commands::{cat, create, extract, list};

#[derive(Parser)]
#[command(name = "arcstream", version, about = "Read and write tar, zip and cpio archives")]
struct Args {
    /// Log filter and format negotiation to stderr
    #[arg(long, global = true)]
    debug: bool,

    /// Pipe the archive through an external (de)compression command
    #[arg(long, global = true)]
    program: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List archive members
    #[command(alias = "ls", alias = "t")]
    List {
        archive: PathBuf,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Write one member's data to stdout
    Cat { archive: PathBuf, member: String },
    /// Create an archive from files and directories
    #[command(alias = "c")]
    Create {
        /// Output path, `-` for stdout
        #[arg(short = 'f', long)]
        output: PathBuf,
        #[arg(long, default_value = "none")]
        filter: String,
        #[arg(long, default_value = "pax_restricted")]
        format: String,
        #[arg(short, long)]
        verbose: bool,
        #[arg(required = true)]
        inputs: Vec<PathBuf>,
    },
    /// Extract archive members
    #[command(alias = "x")]
    Extract {
        archive: PathBuf,
        /// Change to this directory first
        #[arg(short = 'C', long)]
        directory: Option<PathBuf>,
        /// Restore permissions, times and extended attributes
        #[arg(short, long)]
        preserve: bool,
        /// Keep existing files
        #[arg(short, long)]
        keep: bool,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show the library version and compiled-in codecs
    Version,
}

fn run(args: Args) -> anyhow::Result<()> {
    let program = args.program.as_deref();
    match &args.command {
        Command::List { archive, verbose } => list::run(archive, program, *verbose),
        Command::Cat { archive, member } => cat::run(archive, program, member),
        Command::Create {
            output,
            filter,
            format,
            verbose,
            inputs,
        } => create::run(
            output,
            inputs,
            &create::Options {
                filter,
                program,
                format,
                verbose: *verbose,
            },
        ),
        Command::Extract {
            archive,
            directory,
            preserve,
            keep,
            verbose,
        } => extract::run(
            archive,
            program,
            &extract::Options {
                directory: directory.as_deref(),
                preserve: *preserve,
                keep: *keep,
                verbose: *verbose,
            },
        ),
        Command::Version => {
            println!("{}", arcstream::version_string());
            Ok(())
        }
    }
}

fn main() {
    let args = Args::parse();
    cli::logger::init(args.debug);
    if let Err(e) = run(args) {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}
