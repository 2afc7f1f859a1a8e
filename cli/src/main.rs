use std::collections::HashMap;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use metrics_relay::config::{self, DEFAULT_ENDPOINT};
use metrics_relay::emitter::Emitter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Relay one event to a running server.
    Emit {
        /// Event name, e.g. `frontend_route_change`.
        event: String,
        /// Amount added to the counter. Server default is 1.
        #[clap(long, short)]
        value: Option<f64>,
        /// Label as `key=value`. Repeatable.
        #[clap(long = "label", short, value_parser = parse_label)]
        labels: Vec<(String, String)>,
        /// Ingestion endpoint.
        #[clap(long, short, default_value = DEFAULT_ENDPOINT)]
        endpoint: String,
        /// Request timeout in seconds.
        #[clap(long, short)]
        timeout: Option<u64>,
    },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .ok_or_else(|| format!("expected `key=value`, got {raw:?}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    match args.cmd {
        Commands::Emit {
            event,
            value,
            labels,
            endpoint,
            timeout,
        } => {
            let emitter = match Emitter::new(&config::Emitter {
                endpoint,
                timeout_secs: timeout,
            }) {
                Ok(emitter) => emitter,
                Err(err) => {
                    eprintln!("{err}");
                    return ExitCode::FAILURE;
                },
            };

            let labels: HashMap<String, String> = labels.into_iter().collect();
            // a one-shot process must wait, or the runtime drops the request.
            match emitter.emit(event.clone(), value, labels).await {
                Ok(Ok(())) => {
                    println!("Event {event:?} sent to {}.", emitter.endpoint());
                    ExitCode::SUCCESS
                },
                Ok(Err(_)) | Err(_) => ExitCode::FAILURE,
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label() {
        assert_eq!(
            parse_label("path=/login?next=/a"),
            Ok(("path".into(), "/login?next=/a".into()))
        );
        assert!(parse_label("path").is_err());
    }

    #[test]
    fn test_emit_args() {
        let args = Args::parse_from([
            "metrics-relay-cli",
            "emit",
            "frontend_route_change",
            "-l",
            "path=/",
            "--value",
            "2",
        ]);
        let Commands::Emit {
            event,
            value,
            labels,
            endpoint,
            ..
        } = args.cmd;
        assert_eq!(event, "frontend_route_change");
        assert_eq!(value, Some(2.0));
        assert_eq!(labels, vec![("path".to_owned(), "/".to_owned())]);
        assert_eq!(endpoint, DEFAULT_ENDPOINT);
    }
}
