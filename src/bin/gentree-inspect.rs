//! Binary entry point for the store inspector.
#![forbid(unsafe_code)]

use std::error::Error;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use gentree::admin::{inspect_file, verify_file, StateSection, StoreInfo, VerifyReport};
use gentree::{NumberLayout, U64Layout};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "gentree-inspect",
    version,
    about = "Inspect and verify generation-stamped B+ tree store files",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for reports"
    )]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Print the meta page and both tree-state records")]
    Info {
        #[arg(value_name = "STORE")]
        path: PathBuf,
    },

    #[command(about = "Walk the tree and check its structure")]
    Verify {
        #[arg(value_name = "STORE")]
        path: PathBuf,

        #[arg(
            long,
            value_enum,
            default_value_t = LayoutArg::U64,
            help = "Layout the store was created with"
        )]
        layout: LayoutArg,
    },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LayoutArg {
    U64,
    Number,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Info { path } => {
            let info = inspect_file(&path)?;
            emit(cli.format, &info, || print_info_text(&info))?;
        }
        Command::Verify { path, layout } => {
            let report = match layout {
                LayoutArg::U64 => verify_file(&path, &U64Layout)?,
                LayoutArg::Number => verify_file(&path, &NumberLayout)?,
            };
            emit(cli.format, &report, || print_verify_text(&report))?;
            if !report.success {
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: serde::Serialize,
    F: Fn(),
{
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            println!("{json}");
        }
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_field(name: &str, value: impl std::fmt::Display) {
    println!("  {name:.<28} {value}");
}

fn print_info_text(info: &StoreInfo) {
    let meta = &info.meta;
    println!("Meta:");
    print_field("pages", info.page_count);
    print_field("page_size", meta.page_size);
    print_field("salt", format!("{:#018x}", meta.salt));
    match &meta.layout_tag {
        Some(tag) => print_field("layout", format!("{tag} ({:#x})", meta.layout_id)),
        None => print_field("layout", format!("{:#x}", meta.layout_id)),
    }
    print_field(
        "layout_version",
        format!("{}.{}", meta.layout_major, meta.layout_minor),
    );
    print_field("tree_format", meta.tree_format);
    print_field("fixed_size", meta.fixed_size);
    print_field(
        "capacity",
        format!("leaf={} internal={}", meta.leaf_capacity, meta.internal_capacity),
    );
    for state in &info.states {
        println!();
        print_state_text(state);
    }
}

fn print_state_text(state: &StateSection) {
    let marker = if state.current { " (current)" } else { "" };
    println!("State page {}{marker}:", state.page);
    if !state.valid {
        println!("  invalid or never written");
        return;
    }
    let show = |value: Option<u64>| value.map_or_else(|| "-".to_string(), |v| v.to_string());
    print_field("counter", show(state.counter));
    print_field(
        "generations",
        format!(
            "stable={} unstable={}",
            show(state.stable_generation),
            show(state.unstable_generation)
        ),
    );
    print_field(
        "root",
        format!("{} (generation {})", show(state.root), show(state.root_generation)),
    );
    print_field("next_page", show(state.next_page));
    print_field("free_list_head", show(state.free_list_head));
    print_field("clean", state.clean.unwrap_or(false));
    match (&state.payload_text, state.payload_len) {
        (Some(text), _) => print_field("header", format!("{text:?}")),
        (None, Some(len)) => print_field("header", format!("{len} bytes")),
        (None, None) => print_field("header", "-"),
    }
}

fn print_verify_text(report: &VerifyReport) {
    let counts = &report.counts;
    println!(
        "Verify => success={} root={} height={} leaves={} internal={} entries={} crash_pointers={}",
        report.success,
        counts.root,
        counts.height,
        counts.leaf_pages,
        counts.internal_pages,
        counts.entries,
        counts.crash_pointers,
    );
    for finding in &report.findings {
        match finding.page {
            Some(page) => println!("- {:?} (page {page}): {}", finding.severity, finding.message),
            None => println!("- {:?}: {}", finding.severity, finding.message),
        }
    }
}
