use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use flowjit::driver::{Report, render_human};
use flowjit::{CompilationUnit, CompileOutcome, CompiledFunction, CompilerConfig, Driver, OutputFormat, Runtime};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;

/// Exit status of a compilation that bailed out.
const EXIT_BAILOUT: u8 = 2;

// Wrapper type for clap ValueEnum support
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormatArg {
    #[default]
    Human,
    Json,
}

impl From<OutputFormatArg> for OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Human => OutputFormat::Human,
            OutputFormatArg::Json => OutputFormat::Json,
        }
    }
}

#[derive(Parser)]
#[command(name = "flowjit")]
#[command(about = "Baseline x86-64 compiler for flow graphs", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a JSON compilation unit
    Compile {
        /// Compilation unit (classes, function and flow graph)
        unit: PathBuf,

        /// Compiler configuration (TOML)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, value_enum, default_value = "human")]
        format: OutputFormatArg,

        /// Emit function entry and exit tracing calls
        #[arg(long)]
        trace_functions: bool,

        /// Check the argument count of every fixed-arity function
        #[arg(long)]
        verify_arguments: bool,

        /// Copy the code into executable memory
        #[arg(long)]
        install: bool,

        /// Write the raw code bytes to FILE
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Compile {
            unit,
            config,
            format,
            trace_functions,
            verify_arguments,
            install,
            output,
        } => {
            let mut config = match config {
                Some(path) => match CompilerConfig::load(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        return ExitCode::FAILURE;
                    }
                },
                None => CompilerConfig::default(),
            };
            config.trace_functions |= trace_functions;
            config.verify_arguments |= verify_arguments;

            let options = CompileOptions {
                format: format.into(),
                install,
                output,
            };
            run_compile(&unit, config, &options)
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::WARN,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

struct CompileOptions {
    format: OutputFormat,
    install: bool,
    output: Option<PathBuf>,
}

fn run_compile(path: &Path, config: CompilerConfig, options: &CompileOptions) -> ExitCode {
    let unit = match CompilationUnit::load(path) {
        Ok(unit) => unit,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut driver = Driver::new(config);
    let compiled = match driver.compile_unit(&unit) {
        Ok(CompileOutcome::Compiled(compiled)) => compiled,
        Ok(CompileOutcome::BailedOut { function, reason }) => {
            eprintln!("bailout in `{}`: {}", function, reason);
            return ExitCode::from(EXIT_BAILOUT);
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = emit(&compiled, driver.runtime(), options) {
        eprintln!("error: {}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn emit(compiled: &CompiledFunction, runtime: &Runtime, options: &CompileOptions) -> Result<(), String> {
    if let Some(output) = &options.output {
        fs::write(output, &compiled.code).map_err(|e| format!("failed to write {}: {}", output.display(), e))?;
    }

    if options.install {
        install(compiled)?;
    }

    match options.format {
        OutputFormat::Human => print!("{}", render_human(compiled, runtime)),
        OutputFormat::Json => {
            let report = Report::new(compiled, runtime);
            let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
            println!("{}", json);
        }
    }
    Ok(())
}

#[cfg(feature = "jit")]
fn install(compiled: &CompiledFunction) -> Result<(), String> {
    let installed = compiled.install().map_err(|e| e.to_string())?;
    tracing::info!(
        function = %compiled.name,
        entry_point = %format!("{:#x}", installed.descriptors.entry_point()),
        size = installed.memory.size(),
        "installed"
    );
    Ok(())
}

#[cfg(not(feature = "jit"))]
fn install(_compiled: &CompiledFunction) -> Result<(), String> {
    Err("installing code requires the `jit` feature".to_string())
}
