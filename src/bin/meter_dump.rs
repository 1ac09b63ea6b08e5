use clap::Parser;
use log::{error, warn};
use sml2mqtt::config::Config;
use sml2mqtt::metering_sml::report::format_records;
use sml2mqtt::metering_sml::{decode_frame, FrameAssembler};
use sml2mqtt::serial::{MeterSource, SerialMeter};
use std::path::PathBuf;
use std::process::ExitCode;

/// Read one chunk from the meter and print every decoded value
#[derive(Parser, Debug)]
#[command(name = "meter-dump", version)]
struct Args {
    /// Serial port of the IR reading head
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    port: Option<String>,

    /// Baud rate
    #[arg(long)]
    baud: Option<u32>,

    /// Path of a YAML config file
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Number of bytes to read
    #[arg(long)]
    bytes: Option<usize>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let default_filter = std::env::var("SML2MQTT_LOG_LEVEL").unwrap_or("warn".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let args = Args::parse();
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(port) = args.port {
        config.serial.port = port;
    }
    if let Some(baud) = args.baud {
        config.serial.baud = baud;
    }
    let budget = args.bytes.unwrap_or(config.serial.read_budget);

    let mut meter = match SerialMeter::open(&config.serial) {
        Ok(meter) => meter,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let chunk = match meter.read_chunk(budget, config.read_timeout()).await {
        Ok(chunk) => chunk,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    meter.close();
    println!("Received {} bytes from {}", chunk.len(), config.serial.port);

    let mut assembler = FrameAssembler::new();
    assembler.add(&chunk);

    let mut frames = 0;
    while let Some(frame) = assembler.next_frame() {
        frames += 1;
        println!();
        println!("Frame {} ({} bytes)", frames, frame.len());
        match decode_frame(&frame) {
            Ok(mut records) => {
                for line in format_records(&mut records) {
                    println!("  {}", line);
                }
            }
            Err(e) => warn!("Frame {} dropped ({} error): {}", frames, e.kind(), e),
        }
    }

    if frames == 0 {
        println!("No complete SML frame found");
    }
    ExitCode::SUCCESS
}
