use clap::Parser;
use log::{error, info};
use sml2mqtt::config::{Config, PublisherArgs};
use sml2mqtt::poller::cancel_on_signal;
use sml2mqtt::{MqttPublisher, PollLoop, PollSettings, SerialMeter};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    let default_filter = std::env::var("SML2MQTT_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let args = PublisherArgs::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    config.apply_args(&args);
    if let Err(e) = config.validate() {
        error!("{}", e);
        return ExitCode::FAILURE;
    }

    let publisher = match MqttPublisher::connect(&config.mqtt, &config.client_id()).await {
        Ok(publisher) => publisher,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let source = match SerialMeter::open(&config.serial) {
        Ok(source) => source,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let token = CancellationToken::new();
    cancel_on_signal(token.clone());

    let mut poll_loop = PollLoop::new(source, publisher, PollSettings::from(&config));
    poll_loop.run(token).await;

    info!("sml2mqtt stopped");
    ExitCode::SUCCESS
}
