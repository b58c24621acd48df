use clap::Parser;
use eyre::Context;
use ftracectl::CaptureEngine;
use ftracectl::EventController;
use ftracectl::EventSelect;
use ftracectl::FormatDatabase;
use ftracectl::Instance;
use ftracectl::InstanceManager;
use ftracectl::SysSpawner;
use ftracectl::SysTraceFs;
use ftracectl::TraceReader;
use ftracectl::TracerController;
use std::io::Write;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

mod cli {
    #[derive(clap_derive::Parser)]
    #[command(version, about)]
    /// Control ftrace and decode its raw ring buffer
    pub struct Cli {
        #[clap(short, long)]
        pub verbose: bool,
        /// Operate on this tracing instance instead of the top level
        #[clap(short, long)]
        pub instance: Option<String>,
        #[clap(subcommand)]
        pub command: Command,
    }

    #[derive(clap_derive::Subcommand)]
    pub enum Command {
        /// List the event systems and events the kernel knows about
        Events {
            /// Restrict the listing to one system
            #[clap(long)]
            system: Option<String>,
        },
        /// List the tracers the kernel offers
        Tracers,
        /// Run a command under trace, then dump the captured events as
        /// JSON lines
        Record {
            /// Enable these events first ("system" or "system:event")
            #[clap(short, long)]
            event: Vec<String>,
            /// The command to run, with its arguments
            #[clap(required = true, last = true)]
            argv: Vec<String>,
        },
        /// Decode what the ring buffer currently holds as JSON lines
        Read {
            /// Keep polling for new events instead of stopping
            #[clap(long)]
            follow: bool,
        },
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let cli = cli::Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let fs = Arc::new(SysTraceFs::discover().wrap_err("no usable tracefs mount")?);
    let instance = match &cli.instance {
        Some(name) => InstanceManager::new(Arc::clone(&fs)).get(name)?,
        None => Instance::top_level(),
    };
    let db = Arc::new(
        FormatDatabase::load(fs.as_ref(), instance.name())
            .wrap_err("failed to load event format descriptors")?,
    );

    match cli.command {
        cli::Command::Events { system } => {
            let stdout = std::io::stdout().lock();
            let mut out = std::io::BufWriter::new(stdout);
            match system {
                Some(system) => {
                    if !db.has_system(&system) {
                        return Err(eyre::eyre!("unknown event system {system:?}"));
                    }
                    for event in db.events_in(&system) {
                        writeln!(out, "{}:{}", event.system, event.name)?;
                    }
                }
                None => {
                    for event in db.iter() {
                        writeln!(out, "{}:{}", event.system, event.name)?;
                    }
                }
            }
            out.flush()?;
        }
        cli::Command::Tracers => {
            let tracer = TracerController::new(Arc::clone(&fs));
            for name in tracer.available_tracers(&instance)? {
                println!("{name}");
            }
        }
        cli::Command::Record { event, argv } => {
            let events = EventController::new(Arc::clone(&fs), Arc::clone(&db));
            for spec in &event {
                match spec.split_once(':') {
                    Some((system, name)) => {
                        events.enable(&instance, Some(system), EventSelect::One(name))?;
                    }
                    None => events.enable(&instance, Some(spec.as_str()), EventSelect::All)?,
                }
            }
            let engine = CaptureEngine::new(Arc::clone(&fs), Arc::clone(&db), SysSpawner);
            let status = engine.trace_process(&instance, &argv, None)?;
            if status != 0 {
                log::warn!("child exited with status {status}");
            }
            dump(&fs, &db, &instance)?;
        }
        cli::Command::Read { follow } => {
            if follow {
                let reader = TraceReader::new(Arc::clone(&fs), Arc::clone(&db));
                let stdout = std::io::stdout().lock();
                let mut out = std::io::BufWriter::new(stdout);
                reader.follow_trace(&instance, Duration::from_millis(500), |event| {
                    if write_event(&mut out, &event).is_err() {
                        return ControlFlow::Break(());
                    }
                    ControlFlow::Continue(())
                })?;
                out.flush()?;
            } else {
                dump(&fs, &db, &instance)?;
            }
        }
    }
    Ok(())
}

fn dump(
    fs: &Arc<SysTraceFs>,
    db: &Arc<FormatDatabase>,
    instance: &Instance,
) -> eyre::Result<()> {
    let reader = TraceReader::new(Arc::clone(fs), Arc::clone(db));
    let stdout = std::io::stdout().lock();
    let mut out = std::io::BufWriter::new(stdout);
    for event in reader.read_trace(instance)? {
        write_event(&mut out, &event)?;
    }
    out.flush()?;
    Ok(())
}

fn write_event<W: Write>(out: &mut W, event: &ftracectl::DecodedEvent) -> eyre::Result<()> {
    serde_json::to_writer(&mut *out, event)?;
    out.write_all(b"\n")?;
    Ok(())
}
