use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

use lnc::demos::{Demo, NAMES};
use lnc::interp::Interpreter;
use lnc::{LowerOptions, Module, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Emit {
    /// Lowered statement of every function
    Stmt,
    /// JSON summary of the module
    Json,
    /// SHA-256 of the lowered IR
    Fingerprint,
    /// Argument list of the entry function
    Args,
    /// Interpret the module on the demo's inputs and print the outputs
    Run,
}

#[derive(Parser, Debug)]
#[command(
    name = "lnc",
    version,
    about = "LoopNest Compiler - lowers scheduled demo pipelines to loop-nest IR"
)]
struct Cli {
    /// Demo pipeline to lower
    #[arg(long, default_value = "blur", value_parser = clap::builder::PossibleValuesParser::new(NAMES.iter().copied()))]
    demo: String,

    /// Target string, e.g. `host`, `x86-64-linux-avx2`, `host-cuda`
    #[arg(long)]
    target: Option<String>,

    /// JSON file with lowering options; `--target` overrides its target
    #[arg(long)]
    options: Option<PathBuf>,

    /// Output form
    #[arg(long, value_enum, default_value_t = Emit::Stmt)]
    emit: Emit,

    /// Log lowering passes and timings
    #[arg(long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "lnc=debug" } else { "lnc=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn fail(code: i32, message: impl std::fmt::Display) -> ! {
    eprintln!("lnc: {}", message);
    std::process::exit(code);
}

fn load_options(cli: &Cli) -> LowerOptions {
    let mut options = match &cli.options {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .unwrap_or_else(|e| fail(2, format!("error: {}: {}", path.display(), e)));
            LowerOptions::from_json(&text)
                .unwrap_or_else(|e| fail(2, format!("error: {}: {}", path.display(), e)))
        }
        None => LowerOptions::default(),
    };
    if let Some(t) = &cli.target {
        options.target = t
            .parse::<Target>()
            .unwrap_or_else(|e| fail(2, format!("error: bad target `{}`: {}", t, e)));
    }
    if cli.verbose {
        options.debug_level = options.debug_level.max(1);
    }
    options
}

fn emit(cli: &Cli, demo: &Demo, module: &Module) {
    match cli.emit {
        Emit::Stmt => {
            for f in &module.functions {
                let args: Vec<&str> = f.args.iter().map(|a| a.name.as_str()).collect();
                println!("func {} ({}) {{", f.name, args.join(", "));
                print!("{}", f.body);
                println!("}}");
            }
            for k in &module.kernels {
                println!("kernel {} on {} {{", k.name, k.device);
                print!("{}", k.body);
                println!("}}");
            }
        }
        Emit::Json => match serde_json::to_string_pretty(&module.summary()) {
            Ok(s) => println!("{}", s),
            Err(e) => fail(2, format!("error: {}", e)),
        },
        Emit::Fingerprint => println!("{}", module.fingerprint()),
        Emit::Args => {
            if let Some(entry) = module.entry() {
                for a in &entry.args {
                    println!("{:?} {} {} dims={}", a.kind, a.name, a.ty, a.dimensions);
                }
            }
        }
        Emit::Run => {
            let mut it = Interpreter::new();
            demo.bind(&mut it);
            if let Err(e) = it.run(module) {
                fail(1, e);
            }
            for name in demo.output_names() {
                if let Some(b) = it.buffer(name) {
                    let values: Vec<String> = b.data.iter().map(|v| v.to_string()).collect();
                    println!("{} = [{}]", name, values.join(", "));
                }
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let options = load_options(&cli);

    let demo = match Demo::by_name(&cli.demo) {
        Ok(Some(d)) => d,
        Ok(None) => fail(2, format!("error: unknown demo `{}`", cli.demo)),
        Err(e) => fail(1, e),
    };
    for w in demo.pipeline.warnings() {
        eprintln!("lnc: {}", w);
    }

    let module = match lnc::lower(&demo.pipeline, &demo.outputs, &demo.args, &options, Vec::new()) {
        Ok(m) => m,
        Err(e) => fail(1, e),
    };
    for w in &module.warnings {
        eprintln!("lnc: {}", w);
    }
    emit(&cli, &demo, &module);
}
