use clap::Parser;
use log::{error, info};
use sml2mqtt::config::{validate_meter_name, Config};
use sml2mqtt::logbook::{collect_readings, LedgerFile, LogRow, RowSink, READ_WAIT};
use std::path::PathBuf;
use std::process::ExitCode;

/// Append today's meter readings to the logbook
#[derive(Parser, Debug)]
#[command(name = "meter-logbook", version)]
struct Args {
    /// Meters to log, one column each
    #[arg(long, value_delimiter = ',', default_value = "light,heating")]
    meters: Vec<String>,

    /// Ledger file the row is appended to
    #[arg(long, default_value = "meter-logbook.csv", value_hint = clap::ValueHint::FilePath)]
    ledger: PathBuf,

    /// Path of a YAML config file (for the broker settings)
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// MQTT broker host
    #[arg(long)]
    broker: Option<String>,

    /// MQTT broker port
    #[arg(long)]
    broker_port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let default_filter = std::env::var("SML2MQTT_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let args = Args::parse();
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(broker) = args.broker {
        config.mqtt.host = broker;
    }
    if let Some(port) = args.broker_port {
        config.mqtt.port = port;
    }

    for meter in &args.meters {
        if let Err(e) = validate_meter_name(meter) {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    }

    let mut ledger = match LedgerFile::open(&args.ledger) {
        Ok(ledger) => ledger,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let client_id = format!("meter-logbook-{}", sml2mqtt::get_unix_ts());
    let readings = match collect_readings(&config.mqtt, &client_id, &args.meters, READ_WAIT).await {
        Ok(readings) => readings,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let today = chrono::Local::now().date_naive();
    let row = LogRow::new(today, &args.meters, &readings);
    if let Err(e) = ledger.append(&row) {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    info!("Logged: {}", row.to_line());
    ExitCode::SUCCESS
}
