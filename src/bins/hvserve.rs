use std::path::PathBuf;
use std::process::exit;

use vmxdbg::attach::ThreadAction;
use vmxdbg::config::HvConfig;
use vmxdbg::debugger::Debugger;
use vmxdbg::errors::HvError;
use vmxdbg::event::{ActionKindRequest, EventRequest, EventType, ModifyKind};
use vmxdbg::feedback::Feedback;
use vmxdbg::halt::ResumeCommand;
use vmxdbg::sim::{SyntheticExit, SIM_PROCESS};
use vmxdbg::ui::json::{Input, JsonUI};
use vmxdbg::ui::Status;
use vmxdbg::vmcs::ExitReason;
use vmxdbg::GuestRegs;

use clap::Parser;
use tracing::trace;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about,
    help_template = r#"{about-section}
{usage-heading} {usage}
{all-args}{tab}

{name}: v{version}
Authors: {author-with-newline}
"#
)]
/// vmxdbg Server - JSON interface to a simulated hypervisor debugger
///
/// Runs the vm-exit engine on a simulated machine. Commands are read from standard input,
/// one JSON object per line, and every command is answered with one JSON line on
/// standard output. Logs go to standard error.
struct Args {
    #[arg(long, short)]
    /// Log everything down to the trace level
    verbose: bool,

    #[arg(long, short)]
    /// Read the engine configuration from this JSON file
    config: Option<PathBuf>,

    #[arg(long)]
    /// Number of simulated cores, overrides the configuration file
    cores: Option<u32>,

    #[arg(long)]
    /// Print example JSON commands and exit
    ///
    /// Displays sample JSON structures for sending commands to the debugger
    example_statuses: bool,

    #[arg(long)]
    /// Print example JSON responses and exit
    ///
    /// Displays sample JSON structures for the responses sent by the debugger
    example_feedbacks: bool,
}

fn main() -> Result<(), HvError> {
    human_panic::setup_panic!();
    let args = Args::parse();
    setup_logger(args.verbose);

    if args.example_statuses {
        example_statuses();
        exit(0);
    }
    if args.example_feedbacks {
        example_feedbacks();
        exit(0);
    }

    let mut config = match &args.config {
        Some(path) => HvConfig::load(path)?,
        None => HvConfig::default(),
    };
    if let Some(cores) = args.cores {
        config.cores = cores;
    }

    let ui = JsonUI::build()?;
    let mut debug: Debugger<_> = Debugger::build(config, ui)?;
    debug.run_debugger()?;
    debug.cleanup()?;

    Ok(())
}

fn example_statuses() {
    let statuses: &[Status] = &[
        Status::RegisterEvent(
            EventRequest::new(EventType::CpuidInstructionExecution)
                .in_process(SIM_PROCESS)
                .with_action(ActionKindRequest::BreakToDebugger),
        ),
        Status::ModifyEvent(0x100_0000, ModifyKind::Disable),
        Status::ListEvents,
        Status::Attach {
            pid: SIM_PROCESS,
            check_entry_point: true,
        },
        Status::ThreadAction {
            token: 0x100_0000,
            thread: 0x10,
            action: ThreadAction::StepIn,
        },
        Status::VmExit {
            core: 0,
            exit: SyntheticExit::instruction(ExitReason::Cpuid, 0x7ff6_4000_1000, 2),
            regs: GuestRegs::default(),
        },
        Status::CollectExits,
        Status::Resume(ResumeCommand::Continue),
        Status::DebuggerQuit,
    ];

    for s in statuses {
        println!(
            "{}",
            serde_json::to_string(&Input { status: s.clone() }).unwrap()
        )
    }
}

fn example_feedbacks() {
    let feedbacks: &[Feedback] = &[
        Feedback::Ok,
        Feedback::HypercallStatus(0),
        Feedback::Attached(0x100_0000),
        Feedback::ExitStarted { ticket: 0, core: 0 },
        HvError::TagNotExists(0x100_0005).into(),
    ];

    for f in feedbacks {
        println!(
            "{}",
            serde_json::to_string(&JsonUI::format_feedback(f)).unwrap()
        )
    }
}

fn setup_logger(verbose: bool) {
    // stdout carries the protocol, traces go to stderr
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(if verbose {
            tracing::Level::TRACE
        } else {
            tracing::Level::INFO
        })
        .with_writer(std::io::stderr)
        .without_time()
        .with_file(false)
        .with_target(false)
        .finish();
    // use that subscriber to process traces emitted after this point
    tracing::subscriber::set_global_default(subscriber).expect("could not setup logger");
    trace!("set up the logger");
}
