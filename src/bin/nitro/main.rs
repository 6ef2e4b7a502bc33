//! CLI front-end (spec §10, ambient — spec.md places this "out of scope,
//! specified only at its interface"). Two subcommands: `trace` streams the
//! §6 JSON event schema to stdout; `filter` demonstrates `define_hook`-driven
//! kernel-side filtering by tracing only the named syscalls.
//!
//! VM lifecycle tooling beyond `find_qemu_pid` (domain lookup, snapshotting,
//! test fixtures) stays an external collaborator per spec.md §1.

mod libvmi;

use std::collections::HashMap;
use std::fs;

use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};
use serde::Serialize;

use nitro::config::Config;
use nitro::error::Result;
use nitro::kvm::driver::KvmDriver;
use nitro::kvm::Direction;
use nitro::memory::OsType;
use nitro::symbols::SymbolBundle;
use nitro::syscall::SyscallRecord;
use nitro::{Nitro, NitroBuilder};

use libvmi::LibvmiView;

fn domain_arg() -> Arg<'static, 'static> {
    Arg::with_name("domain")
        .help("libvirt/qemu domain name of the guest to trace")
        .required(true)
        .index(1)
}

fn os_arg() -> Arg<'static, 'static> {
    Arg::with_name("os")
        .long("os")
        .takes_value(true)
        .possible_values(&["windows", "linux"])
        .required(true)
}

fn symbols_arg() -> Arg<'static, 'static> {
    Arg::with_name("symbols")
        .long("symbols")
        .takes_value(true)
        .required(true)
        .help("path to the symbol bundle JSON (spec §6)")
}

fn parse_os(args: &ArgMatches) -> OsType {
    match args.value_of("os").expect("os is required") {
        "windows" => OsType::Windows,
        "linux" => OsType::Linux,
        _ => unreachable!("clap validated possible_values"),
    }
}

fn open_session(args: &ArgMatches) -> Result<Nitro> {
    let domain = args.value_of("domain").expect("domain is required");
    let os = parse_os(args);
    let symbols_path = args.value_of("symbols").expect("symbols is required");
    let raw = fs::read_to_string(symbols_path).map_err(nitro::error::NitroError::Io)?;

    let sdt_bundle = SymbolBundle::from_json(&raw)?;
    let offsets_bundle = SymbolBundle::from_json(&raw)?;

    let pid = KvmDriver::find_qemu_pid(domain)?;
    let view = Box::new(LibvmiView::new(domain, os, offsets_bundle)?);

    NitroBuilder::new(pid, os, view, sdt_bundle)
        .config(Config::default())
        .build()
}

#[derive(Serialize)]
struct EventView {
    vcpu: u32,
    #[serde(rename = "type")]
    kind: &'static str,
    direction: &'static str,
    cr3: String,
    rax: String,
}

#[derive(Serialize)]
struct RecordView<'a> {
    full_name: &'a str,
    name: &'a str,
    event: EventView,
    #[serde(skip_serializing_if = "Option::is_none")]
    process: Option<&'a nitro::syscall::Process>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hook: Option<&'a serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    modified: Option<&'a HashMap<usize, u64>>,
}

/// Builds the §6 event-output view from a `SyscallRecord`. Kept as a
/// free function rather than a `Serialize` impl on `SyscallRecord` itself
/// so the library crate stays free of an output-format opinion.
fn record_view(record: &SyscallRecord) -> RecordView<'_> {
    RecordView {
        full_name: &record.full_name,
        name: &record.name,
        event: EventView {
            vcpu: record.event.vcpu_index,
            kind: match record.event.kind {
                nitro::kvm::Kind::Syscall => "syscall",
                nitro::kvm::Kind::Sysenter => "sysenter",
            },
            direction: match record.event.direction {
                Direction::Enter => "enter",
                Direction::Exit => "exit",
            },
            cr3: format!("{:#x}", record.event.cr3()),
            rax: format!("{:#x}", record.event.regs.rax),
        },
        process: record.process.as_ref(),
        hook: record.hook_payload.as_ref(),
        modified: if record.modified.is_empty() {
            None
        } else {
            Some(&record.modified)
        },
    }
}

fn trace(args: &ArgMatches) {
    let mut session = match open_session(args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    loop {
        match session.listen() {
            Ok(Some(record)) => {
                let view = record_view(&record);
                match serde_json::to_string(&view) {
                    Ok(line) => println!("{}", line),
                    Err(e) => eprintln!("failed to serialize event: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}", e);
                break;
            }
        }
    }

    if let Err(e) = session.stop() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn filter(args: &ArgMatches) {
    let names: Vec<String> = args
        .values_of("only")
        .expect("only is required")
        .map(str::to_string)
        .collect();

    let mut session = match open_session(args) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    for name in &names {
        for direction in [Direction::Enter, Direction::Exit] {
            let name = name.clone();
            let result = session.define_hook(
                &name,
                direction,
                Box::new(move |record, _args| {
                    let view = record_view(record);
                    if let Ok(line) = serde_json::to_string(&view) {
                        println!("{}", line);
                    }
                    Ok(())
                }),
            );
            if let Err(e) = result {
                eprintln!("failed to filter {} ({:?}): {}", name, direction, e);
                std::process::exit(1);
            }
        }
    }

    loop {
        match session.listen() {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}", e);
                break;
            }
        }
    }

    if let Err(e) = session.stop() {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

fn main() {
    env_logger::init();

    let trace_command = SubCommand::with_name("trace")
        .about("Stream every syscall event as newline-delimited JSON")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(domain_arg())
        .arg(os_arg())
        .arg(symbols_arg());

    let filter_command = SubCommand::with_name("filter")
        .about("Trace only the named syscalls, via kernel-side filtering")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(domain_arg())
        .arg(os_arg())
        .arg(symbols_arg())
        .arg(
            Arg::with_name("only")
                .long("only")
                .takes_value(true)
                .multiple(true)
                .required(true)
                .help("syscall name(s) to filter in"),
        );

    let main_app = App::new("nitro")
        .about("Hypervisor-level syscall tracer for KVM guests")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(trace_command)
        .subcommand(filter_command);

    let matches = main_app.get_matches();
    match matches.subcommand() {
        ("trace", Some(sub)) => trace(sub),
        ("filter", Some(sub)) => filter(sub),
        _ => unreachable!("SubcommandRequiredElseHelp"),
    }
}
