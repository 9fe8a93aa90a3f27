use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use msrflow::agent::power_balancer::{NUM_SAMPLE, POLICY_POWER_LIMIT, SAMPLE_STEP_COUNT};
use msrflow::agent::{Agent, PowerBalancerAgent};
use msrflow::{initctl, PlatformContext, Result};

#[derive(Parser, Debug)]
#[command(name = "msrflow")]
#[command(about = "Batched MSR telemetry and node power balancing")]
struct Args {
    #[arg(
        long,
        help = "Node power budget in watts (default: thermal design power)"
    )]
    policy: Option<f64>,

    #[arg(long, default_value_t = 0.005, help = "Control period in seconds")]
    period: f64,

    #[arg(
        long,
        help = "Stop after this many control intervals (default: run until SIGINT)"
    )]
    ticks: Option<u64>,

    #[arg(long, help = "Control file applied before the loop starts")]
    init_control: Option<PathBuf>,

    #[arg(long, help = "Register metadata document overriding the built-in set")]
    msr_json: Option<PathBuf>,

    #[arg(
        long,
        help = "Epoch counter signal name (default: one epoch per control interval)"
    )]
    epoch_signal: Option<String>,

    #[arg(long, help = "Run against the in-memory register device")]
    simulate: bool,

    #[arg(long, help = "List available signals and controls, then exit")]
    list: bool,

    #[arg(
        short,
        long,
        help = "Enable verbose logging (shows register transactions)"
    )]
    verbose: bool,
}

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(handle_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

fn check_permissions() {
    let paths = [
        msrflow_raw::msr_path(0, msrflow_raw::DriverKind::Safe),
        msrflow_raw::msr_path(0, msrflow_raw::DriverKind::Raw),
    ];
    if paths.iter().all(|p| std::fs::metadata(p).is_err()) {
        eprintln!(
            "\nERROR: no register device found at {} or {}\n\n\
             The msr_safe or msr kernel module may not be loaded.\n\
             Run: sudo modprobe msr_safe (or: sudo modprobe msr)\n",
            paths[0], paths[1]
        );
        std::process::exit(1);
    }
    let open_err = paths
        .iter()
        .filter_map(|p| std::fs::File::open(p).err())
        .find(|e| e.kind() == std::io::ErrorKind::PermissionDenied);
    if paths.iter().any(|p| std::fs::File::open(p).is_ok()) {
        return;
    }
    if open_err.is_some() {
        eprintln!(
            "\nERROR: permission denied accessing the register device\n\n\
             Run as root, or grant read/write access to the msr_safe device nodes.\n"
        );
        std::process::exit(1);
    }
}

fn run_agent(args: &Args, ctx: &PlatformContext) -> Result<()> {
    let io = ctx.io();

    if let Some(path) = &args.init_control {
        let controls = initctl::parse_file(path)?;
        initctl::apply(&mut io.borrow_mut(), &controls)?;
    }

    let mut agent = PowerBalancerAgent::new(io.clone())?
        .with_period(Duration::from_secs_f64(args.period));
    if let Some(name) = &args.epoch_signal {
        agent = agent.with_epoch_signal(name.clone());
    }
    agent.init(0, &[], true)?;

    let mut policy = vec![
        args.policy.unwrap_or(f64::NAN),
        f64::NAN,
        f64::NAN,
        f64::NAN,
    ];
    agent.validate_policy(&mut policy)?;
    tracing::info!("power budget: {} W", policy[POLICY_POWER_LIMIT]);

    let mut sample = vec![0.0; NUM_SAMPLE];
    let mut tick: u64 = 0;
    while RUNNING.load(Ordering::SeqCst) {
        if args.ticks.is_some_and(|limit| tick >= limit) {
            break;
        }
        io.borrow_mut().read_batch()?;
        agent.sample_platform(&mut sample)?;
        agent.adjust_platform(&policy)?;
        if agent.do_write_batch() {
            io.borrow_mut().write_batch()?;
        }
        tick += 1;
        agent.wait();
    }
    tracing::info!(
        "stopping after {tick} control intervals at balancing step {}",
        sample[SAMPLE_STEP_COUNT]
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    let ctx = if args.simulate {
        tracing::info!("using the simulated register device");
        PlatformContext::simulated(2, 4, args.msr_json.as_deref())
            .context("failed to build the simulated platform")?
    } else {
        check_permissions();
        PlatformContext::detect(args.msr_json.as_deref())
            .context("failed to open the platform register devices")?
    };

    if args.list {
        let io = ctx.io();
        let io = io.borrow();
        println!("signals:");
        for name in io.signal_names() {
            println!("  {name}");
        }
        println!("controls:");
        for name in io.control_names() {
            println!("  {name}");
        }
        return Ok(());
    }

    install_signal_handlers()?;

    // Whatever happens in the loop, put the registers back the way we
    // found them.
    ctx.io()
        .borrow_mut()
        .save_controls()
        .context("failed to save the initial control values")?;
    let result = run_agent(&args, &ctx);
    ctx.io().borrow_mut().restore_controls()?;

    Ok(result?)
}
