//! DBMeter demo
//!
//! Streams the microphone sound level to stdout until Ctrl+C.

use anyhow::Context;
use dbmeter::{
    audio, Command, CommandBridge, CpalBackend, InterruptionCenter, MeterController, Request,
    ResultSender,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const READINGS_CALLBACK: &str = "DBMeter-start";
const DESTROY_CALLBACK: &str = "DBMeter-destroy";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dbmeter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("DBMeter v{}", env!("CARGO_PKG_VERSION"));

    let devices = audio::list_input_devices();
    tracing::info!("Input devices: {:?}", devices);

    let (results, mut responses) = ResultSender::channel();
    let controller = MeterController::new(CpalBackend, InterruptionCenter::new());
    let bridge = CommandBridge::new(controller, results);

    bridge.dispatch(Command::new(READINGS_CALLBACK, Request::Start)).await;

    loop {
        tokio::select! {
            response = responses.recv() => {
                let Some(response) = response else { break };
                println!("{}", response.to_json());
                if response.callback_id == READINGS_CALLBACK && !response.result.is_ok() {
                    anyhow::bail!("meter failed to start");
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    bridge.dispatch(Command::new(DESTROY_CALLBACK, Request::Destroy)).await;
    while let Ok(response) = responses.try_recv() {
        if response.callback_id == DESTROY_CALLBACK {
            println!("{}", response.to_json());
        }
    }

    Ok(())
}
