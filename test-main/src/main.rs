mod config;

use std::env::var;
use std::thread::sleep;
use std::time::Duration;
use dotenv::dotenv;
use log::{debug, info};
use sysinfo::System;
use time::OffsetDateTime;
use keyirq::blink::{BlinkCommand, BlinkTimer};
use keyirq::devnum::ChrdevRegistry;
use keyirq::sim::SimBoard;
use keyirq::topology::ChipTopology;
use keyirq::{DriverConfig, KeyError, KeyFile, KeyIrqDriver, Platform};
use keyirq_gpio::gpiod::GpiodChip;
use keyirq_gpio::{GpioActiveLevel, GpioChip, LineOptions};

/// How often the software edge detector samples the key lines.
const EDGE_POLL_PERIOD: Duration = Duration::from_millis(1);
/// How often the main loop polls the device for events.
const READ_POLL_PERIOD: Duration = Duration::from_millis(20);

fn timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        now.hour(),
        now.minute(),
        now.second(),
        now.millisecond()
    )
}

/// Reads one event, if any. `None` when nothing is pending.
fn poll_event(file: &KeyFile<'_>) -> eyre::Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match file.read(&mut buf) {
        Ok(_) => Ok(Some(buf[0])),
        Err(KeyError::NoData) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn load_config() -> eyre::Result<DriverConfig> {
    let path = config::config_path();
    debug!("Trying to load config from {}...", path.display());
    if let Some(config) = config::try_load(&path) {
        info!("Config loaded.");
        Ok(config)
    } else {
        info!("Config not found. Using default");
        let config = DriverConfig::default();
        config::save(&config, &path)?;
        info!("Default config saved to {}.", path.display());
        Ok(config)
    }
}

fn run_gpiod(config: &DriverConfig) -> eyre::Result<()> {
    let chip_path = var("KEYIRQ_CHIP").unwrap_or_else(|_| "/dev/gpiochip0".to_string());
    let led_line: Option<u32> = var("KEYIRQ_LED").ok().map(|s| s.parse()).transpose()?;

    debug!("Initializing GPIO chip {}...", chip_path);
    let chip = GpiodChip::open(&chip_path)?;

    let topology = ChipTopology::resolve_all(&chip, config.keys.iter().map(|key| key.line));
    let interrupts = topology.polled_interrupts(EDGE_POLL_PERIOD);
    let registry = ChrdevRegistry::new();
    let driver = KeyIrqDriver::init(config, Platform {
        topology: &topology,
        interrupts: &interrupts,
        chrdevs: &registry,
    })?;
    debug!("{:?} initialized.", driver);

    let _blink = match led_line {
        Some(line) => {
            let options = LineOptions::default().with_active_level(GpioActiveLevel::Low);
            let led = chip.request_output(line, options, false)?;
            let blink = BlinkTimer::new(led)?;
            blink.command(BlinkCommand::Open)?;
            info!("Blinking LED on line {}.", line);
            Some(blink)
        }
        None => None,
    };

    let file = driver.open()?;
    info!("Waiting for keys...");
    loop {
        if let Some(code) = poll_event(&file)? {
            info!("[{}] key {:#04x}", timestamp(), code);
        }
        sleep(READ_POLL_PERIOD);
    }
}

fn run_sim(config: &DriverConfig) -> eyre::Result<()> {
    let board = SimBoard::new(&config.keys);
    let registry = ChrdevRegistry::new();
    let driver = KeyIrqDriver::init(config, board.platform(&registry))?;
    let file = driver.open()?;
    let settle = driver.debounce_delay() * 3;

    for (index, key) in driver.keys().iter().enumerate() {
        info!("Pressing {} with a bounce storm...", key.name());
        board.bounce(index, 21, Duration::from_micros(200));
        sleep(settle);
        info!("Releasing {} with a bounce storm...", key.name());
        board.bounce(index, 20, Duration::from_micros(200));
        board.release(index);
        sleep(settle);

        match poll_event(&file)? {
            Some(code) => info!(
                "[{}] key {:#04x} after {} samples",
                timestamp(),
                code,
                board.reads(index)
            ),
            None => info!("[{}] {} produced no event", timestamp(), key.name()),
        }
    }

    drop(file);
    driver.teardown()?;
    Ok(())
}

fn main() -> eyre::Result<()> {
    // Initialize environment and logger
    dotenv().ok();
    pretty_env_logger::init();

    const UNKNOWN_STR: &str = "???";

    info!("keyirq {} starting...", env!("CARGO_PKG_VERSION"));
    info!(
        "System {} ver {} kernel ver {}",
        System::name().as_deref().unwrap_or(UNKNOWN_STR),
        System::long_os_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::kernel_version().as_deref().unwrap_or(UNKNOWN_STR),
    );
    info!("Architecture {}", System::cpu_arch());

    let config = load_config()?;
    config.validate()?;

    let backend = var("KEYIRQ_BACKEND").unwrap_or_else(|_| "gpiod".to_string());
    match backend.as_str() {
        "gpiod" => run_gpiod(&config),
        "sim" => run_sim(&config),
        other => Err(eyre::eyre!("Unknown backend {:?}, expected gpiod or sim", other)),
    }
}
