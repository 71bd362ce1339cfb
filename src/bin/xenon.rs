extern crate xenon;
extern crate env_logger;
extern crate termcolor;
#[macro_use] extern crate log;
#[macro_use] extern crate structopt;

use xenon::cpu::{Options, Processor, ThreadState};
use xenon::cpu::export_resolver::{Export, ExportKind, ExportResolver};
use xenon::cpu::module::RawModule;
use xenon::memory::{MmapMemory, VirtualMemory};

use structopt::StructOpt;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

use std::error::Error;
use std::fs;
use std::io::Write;
use std::num::ParseIntError;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, StructOpt)]
#[structopt(name = "xenon", about = "Xbox 360 CPU core inspector.")]
struct Opt {
    /// Path to a raw big-endian code image.
    #[structopt(parse(from_os_str))]
    path: PathBuf,

    /// Guest address the image is mapped at (hex).
    #[structopt(long = "base", default_value = "82000000", parse(try_from_str = "parse_hex"))]
    base: u32,

    /// Entry point to resolve (hex); defaults to the base address.
    #[structopt(long = "entry", parse(try_from_str = "parse_hex"))]
    entry: Option<u32>,

    /// CPU backend selector ("x64" or "any").
    #[structopt(long = "cpu", default_value = "any")]
    cpu: String,
}

fn parse_hex(s: &str) -> Result<u32, ParseIntError> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16)
}

/// Demo slice of the XAM voice export table, thunked into the builtin
/// region at startup.
static XAM_EXPORTS: &[Export] = &[
    Export { ordinal: 1, name: "XamVoiceIsActiveProcess", kind: ExportKind::Function },
    Export { ordinal: 2, name: "XamVoiceCreate", kind: ExportKind::Function },
    Export { ordinal: 3, name: "XamVoiceClose", kind: ExportKind::Function },
    Export { ordinal: 4, name: "XamVoiceHeadsetPresent", kind: ExportKind::Function },
];

fn tag(stdout: &mut StandardStream, color: Color, label: &str, rest: &str) -> std::io::Result<()> {
    stdout.set_color(ColorSpec::new().set_fg(Some(color)).set_bold(true))?;
    write!(stdout, "{:>9} ", label)?;
    stdout.reset()?;
    writeln!(stdout, "{}", rest)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opt = Opt::from_args();
    let mut stdout = StandardStream::stdout(ColorChoice::Auto);

    let contents = fs::read(&opt.path)?;
    if contents.is_empty() {
        return Err("image is empty".into());
    }
    let high = opt.base + contents.len() as u32;

    let mut mem = MmapMemory::new();
    mem.add_mapping(opt.base..=high - 1, &contents)?;

    let export_resolver = Arc::new(ExportResolver::new());
    export_resolver.register_table("xam.xex", XAM_EXPORTS);

    let mut processor = Processor::new(
        Arc::new(mem),
        export_resolver.clone(),
        None,
        Options {
            backend: opt.cpu,
            debug_info: Default::default(),
        },
    );
    processor.setup()?;

    // Bridge the callable exports into the builtin region. Calling one just
    // reports it as unimplemented for now.
    let mut first_thunk = None;
    for export in XAM_EXPORTS {
        if export.kind != ExportKind::Function {
            continue;
        }
        let name = export.name;
        let function = processor.define_builtin(name, move |_state, ordinal, _| {
            error!("unimplemented kernel export {} (#{})", name, ordinal);
            0
        }, export.ordinal as u64, 0);
        tag(&mut stdout, Color::Cyan, "thunk", &format!("{} -> {:#010X}", name, function.address()))?;
        first_thunk.get_or_insert(function.address());
    }

    let module_name = opt.path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "raw".to_string());
    processor.add_module(Arc::new(RawModule::new(module_name.clone(), opt.base, high)));
    tag(&mut stdout, Color::Cyan, "module", &format!("{} [{:#010X}..{:#010X})", module_name, opt.base, high))?;

    // Resolve the entry point through the lazy translation path.
    let entry = opt.entry.unwrap_or(opt.base);
    match processor.resolve_function(entry) {
        Some(function) => {
            tag(&mut stdout, Color::Green, "ready", &format!(
                "{} [{:#010X}..{:#010X}), status {:?}",
                function.name(), function.address(), function.end_address(), function.status(),
            ))?;
        }
        None => {
            tag(&mut stdout, Color::Red, "failed", &format!("could not resolve {:#010X}", entry))?;
        }
    }

    if let Some(backend) = processor.backend() {
        let cache = backend.code_cache();
        tag(&mut stdout, Color::Cyan, "cache", &format!(
            "{} unit(s), {} bytes", cache.span_count(), cache.used_bytes(),
        ))?;
    }

    // Builtin dispatch works end to end; demonstrate it on the first thunk.
    if let Some(address) = first_thunk {
        let mut state = ThreadState::new(1, 0x7000_0000);
        let result = processor.execute_with_args(&mut state, address, &[]);
        tag(&mut stdout, Color::Green, "call", &format!(
            "builtin {:#010X} returned {:#X}", address, result,
        ))?;
    }

    Ok(())
}
