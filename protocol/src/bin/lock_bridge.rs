use chrono::{Datelike, Local};
use clap::Parser;
use std::{error::Error, time::Duration};
use tokio::time::{self, Instant};
use tuya_lock::{
    Link,
    engine::{Config, Engine, NetworkStatus, WifiState},
    time::LocalTime,
};

/// Interval at which the engine is polled while the port is idle
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Earliest year a synchronized system clock can show
const MIN_SYNCED_YEAR: i32 = 2020;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate of the MCU
    #[arg(short, long, default_value_t = tuya_lock::serial::DEFAULT_BAUD_RATE)]
    baud_rate: u32,

    /// Base32 encoded secret for verifying dynamic passwords
    #[arg(short, long)]
    totp_secret: Option<String>,

    /// Datapoint whose reports are ignored (can be repeated)
    #[arg(short, long)]
    ignore: Vec<u8>,

    /// Datapoint whose changes are printed (can be repeated)
    #[arg(short, long)]
    watch: Vec<u8>,

    /// Signal strength reported to the MCU in dBm
    #[arg(short, long, default_value_t = -50, allow_negative_numbers = true)]
    rssi: i8,

    /// Report the module as enabled once initialized
    #[arg(short, long)]
    enabled: bool,
}

/// Always reports a cloud connection with a fixed signal strength
struct CloudConnection {
    rssi: i8,
}

impl NetworkStatus for CloudConnection {
    fn wifi_state(&self) -> WifiState {
        WifiState::CloudConnected
    }

    fn rssi(&self) -> i8 {
        self.rssi
    }
}

fn system_time() -> Option<LocalTime> {
    let now = Local::now();

    (now.year() >= MIN_SYNCED_YEAR).then(|| LocalTime::from_datetime(&now))
}

fn elapsed_millis(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = Config {
        ignored_datapoints: args.ignore,
        ..Config::default()
    };
    let mut engine = Engine::new(config);

    if let Some(secret) = &args.totp_secret {
        engine.set_totp_secret(secret);
    }

    engine.set_time_source(system_time);
    engine.set_network_status(CloudConnection { rssi: args.rssi });
    engine.add_on_initialized(|| println!("MCU initialized"));

    for id in args.watch {
        engine.register_listener(id, |dp| {
            println!("Datapoint {} ({}): {}", dp.id, dp.kind(), dp.value);
        });
    }

    engine.setup();
    engine.dump_config();

    if args.enabled {
        engine.set_enabled(true);
    }

    let port = tuya_lock::serial::open(&args.port, args.baud_rate)?;
    let mut link = Link::new(port, engine);
    let start = Instant::now();
    let mut failure_reported = false;

    loop {
        // Dropping the pending read on timeout loses no data
        if let Ok(res) = time::timeout(POLL_INTERVAL, link.receive(elapsed_millis(start))).await {
            res?;
        }

        link.tick(elapsed_millis(start)).await?;

        if link.engine().init_failed() && !failure_reported {
            eprintln!("MCU did not respond to the product query");
            failure_reported = true;
        }
    }
}
