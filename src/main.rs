use clap::{Parser, Subcommand};
use std::error::Error;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uio_triple_buffer::{
    Config, CycleStats, Exchange, ExchangeError, HeapRegion, LockConfig, Region, RegionLayout,
    Scheduler, SharedImage, Side, SimulatedDevice, UioRegion,
};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Parser)]
#[command(version, about = "Cyclic process data exchange over a UIO triple-buffer region")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Exchange process data with the UIO device until interrupted.
    Run {
        /// TOML configuration file; built-in defaults if omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Run the same loop against a simulated device in this process.
    Simulate {
        #[arg(long, default_value_t = 1000)]
        cycles: u64,
        #[arg(long, default_value_t = 1000)]
        period_us: u64,
        #[arg(long, default_value_t = 250)]
        device_period_us: u64,
    },
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let res = match cli.command {
        Command::Run { config } => run(config),
        Command::Simulate {
            cycles,
            period_us,
            device_period_us,
        } => simulate(
            cycles,
            Duration::from_micros(period_us),
            Duration::from_micros(device_period_us),
        ),
    };

    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: Option<PathBuf>) -> Result<(), Box<dyn Error>> {
    let config = match config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let layout = config.layout.region_layout()?;

    let region = UioRegion::open(&config.device.uio_device, &config.device.map_size_path)?;
    let image = Arc::new(SharedImage::open(region, layout, config.lock)?);
    config.realtime.apply()?;
    install_sigint()?;

    let mut io = Exchange::new(image, Side::Controller)?;
    let scheduler = Scheduler::new(config.cycle.period())?;
    let stats = counter_loop(&mut io, &scheduler, None)?;
    report(&stats);

    // Dropping the last endpoint unmaps the region, now that the loop is over.
    drop(io);
    Ok(())
}

fn simulate(cycles: u64, period: Duration, device_period: Duration) -> Result<(), Box<dyn Error>> {
    let layout = RegionLayout::default();
    let image = Arc::new(SharedImage::format(
        HeapRegion::new(layout.required_len()),
        layout,
        LockConfig::default(),
    )?);
    install_sigint()?;

    let device = SimulatedDevice::echo(image.clone(), device_period)?;
    let mut io = Exchange::new(image, Side::Controller)?;
    let scheduler = Scheduler::new(period)?;
    let stats = counter_loop(&mut io, &scheduler, Some(cycles))?;

    log::info!(
        "device ran {} cycles, consumed {} output buffers",
        device.cycles(),
        device.consumed()
    );
    device.stop();
    report(&stats);
    Ok(())
}

/// Writes an incrementing counter into the first output byte each cycle and
/// picks up the first input byte whenever the device has published.
///
/// Stops at the first exchange fault.
fn counter_loop<R: Region>(
    io: &mut Exchange<R>,
    scheduler: &Scheduler,
    limit: Option<u64>,
) -> Result<CycleStats, Box<dyn Error>> {
    let (tx, rx) = io.split();
    let mut counter: u8 = 0;
    let mut fault: Option<ExchangeError> = None;

    let stats = scheduler.run_until(&SHUTDOWN, |cycle| {
        counter = counter.wrapping_add(1);
        let published = tx.publish_with(|output| {
            if let Some(b) = output.first_mut() {
                *b = counter;
            }
        });
        if let Err(e) = published {
            fault = Some(e);
            return ControlFlow::Break(());
        }

        match rx.try_consume() {
            Ok(Some(input)) => {
                log::trace!("cycle {}: new input {:?}", cycle.index, input.first())
            }
            Ok(None) => {}
            Err(e) => {
                fault = Some(e);
                return ControlFlow::Break(());
            }
        }

        match limit {
            Some(n) if cycle.index + 1 >= n => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    })?;

    match fault {
        Some(e) => Err(e.into()),
        None => Ok(stats),
    }
}

fn report(stats: &CycleStats) {
    log::info!("{} cycles, {} overruns", stats.cycles, stats.overruns);
    if let Some(summary) = stats.lateness_ns.summary() {
        summary.print_csv("lateness_ns");
    }
}

extern "C" fn on_sigint(_signum: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

fn install_sigint() -> std::io::Result<()> {
    let handler = on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t;
    if unsafe { libc::signal(libc::SIGINT, handler) } == libc::SIG_ERR {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
