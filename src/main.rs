use std::process::ExitCode;
use std::thread::sleep;

use bulk_speed_test::config::TEST_INTERVAL;
use bulk_speed_test::{
    direction_name, BenchConfig, BenchError, BenchmarkDriver, Direction, LibusbDevice,
};
use log::{error, info};
use rusb::Context;
use simplelog::{ColorChoice, CombinedLogger, Config, LevelFilter, TermLogger, TerminalMode};

fn main() -> ExitCode {
    if let Err(err) = CombinedLogger::init(vec![TermLogger::new(
        LevelFilter::Info,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )]) {
        eprintln!("Could not configure the logger: {}", err);
    }

    let config = BenchConfig::default();

    info!("Total data transmitted for each test: {} bytes", config.test_data_size);
    info!(
        "Individual transfer size: {} bytes (IN), {} bytes (OUT)",
        config.transfer_size, config.out_transfer_size
    );
    info!(
        "Transfer queue depth: {} (IN), {} (OUT)",
        config.in_queue_depth, config.out_queue_depth
    );

    let context = match Context::new() {
        Ok(context) => context,
        Err(err) => {
            error!("USB Bulk speed test failed: {}", err);
            return ExitCode::FAILURE;
        }
    };

    for (i, direction) in [Direction::In, Direction::Out].into_iter().enumerate() {
        if i > 0 {
            sleep(TEST_INTERVAL);
        }

        info!("Running {} speed test...", direction_name(direction));

        let mut driver = BenchmarkDriver::new(&config, direction);
        match driver.run(|device| LibusbDevice::open(&context, device)) {
            Ok(_) => {}
            Err(err @ BenchError::Setup(_)) => {
                error!("USB Bulk speed test failed: {}", err);
                return ExitCode::from(err.exit_code());
            }
            Err(err) => {
                error!("{}", err);
                return ExitCode::from(err.exit_code());
            }
        }
    }

    ExitCode::SUCCESS
}
