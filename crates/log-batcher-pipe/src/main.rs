// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::str::FromStr;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use log_batcher::{LogLevel, Logger, LoggerConfig};

mod input;

#[tokio::main]
pub async fn main() {
    let log_level = env::var("LOG_BATCHER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let default_level = match env::var("LOG_BATCHER_PIPE_LEVEL") {
        Ok(level) => LogLevel::from_str(&level).unwrap_or_else(|e| {
            warn!("{e}, defaulting to INFO");
            LogLevel::Info
        }),
        Err(_) => LogLevel::Info,
    };

    let config = match LoggerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on log-batcher-pipe startup: {e}");
            return;
        }
    };

    let logger = match Logger::start(&config).await {
        Ok(logger) => logger,
        Err(e) => {
            error!("Error starting logger: {e}");
            return;
        }
    };
    info!(
        "Batching stdin with {} transport(s), minimum level {}",
        config.transports().len(),
        logger.minimum_level()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut forwarded: u64 = 0;

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(parsed) = input::parse_line(&line, default_level) {
                        let payload = parsed.payload_values();
                        if logger.log(parsed.level, parsed.message, payload) {
                            forwarded += 1;
                        }
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    break;
                }
            },
            result = &mut shutdown => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                    Err(e) => error!("Failed to listen for Ctrl+C: {e}"),
                }
                break;
            }
        }
    }

    logger.shutdown().await;
    info!("Forwarded {forwarded} record(s), shut down");
}
